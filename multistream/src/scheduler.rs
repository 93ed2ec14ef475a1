//! Deferred-write scheduler for low-priority flows
//!
//! A low-priority write reserves its space under the flow lock, copies the
//! caller's bytes and queues them; one worker thread appends queued writes
//! in submission order. Since the space is taken at submission, concurrent
//! writers can never oversubscribe the flow, whenever the copy lands.
//!
//! The queue is a bounded `tokio::sync::mpsc` channel used from plain
//! threads: submitters use `try_send`, the worker uses `blocking_recv`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::gate::GateGuard;
use crate::io::ChunkStore;

/// Bytes waiting to be appended to a flow, space already reserved
struct PendingWrite {
    flow: Arc<Flow>,
    data: Vec<u8>,
}

enum Task {
    Write(PendingWrite),
    /// Answered once every task queued before it has run
    Barrier(oneshot::Sender<()>),
}

/// Handle of the deferred-write worker
///
/// Dropping the handle closes the queue, lets the worker finish what is
/// queued, and joins it.
#[derive(Debug)]
pub struct DeferredWriter {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredWriter {
    /// Spawn the worker with a queue of `depth` pending writes
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the worker thread cannot be spawned.
    pub fn start(depth: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let worker = thread::Builder::new()
            .name("multistream-deferred".into())
            .spawn(move || run(receiver))
            .map_err(|e| {
                error!(error = %e, "failed to spawn deferred worker");
                Error::OutOfMemory
            })?;
        debug!(depth, "deferred worker started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Reserve `bytes.len()` bytes on the locked flow and queue a copy.
    ///
    /// The caller must have clipped `bytes` to the free space. On error the
    /// reservation is rolled back before returning, so the flow's levels are
    /// as they were.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the copy cannot be allocated or the queue is
    /// full, [`Error::ShutDown`] if the worker is stopped.
    pub(crate) fn submit(
        &self,
        flow: &Arc<Flow>,
        guard: &mut GateGuard<'_, ChunkStore>,
        bytes: &[u8],
    ) -> Result<()> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| Error::OutOfMemory)?;
        data.extend_from_slice(bytes);

        let len = data.len();
        guard.reserve(len);

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender
                .try_send(Task::Write(PendingWrite {
                    flow: Arc::clone(flow),
                    data,
                }))
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => Error::OutOfMemory,
                    mpsc::error::TrySendError::Closed(_) => Error::ShutDown,
                }),
            None => Err(Error::ShutDown),
        };
        if let Err(e) = sent {
            guard.unreserve(len);
            debug!(bytes = len, error = %e, "deferred submit rolled back");
            return Err(e);
        }
        // The worker needs the lock held by the caller, so it cannot finish
        // this write before the counter is raised
        flow.deferred_queued();
        trace!(bytes = len, "deferred write queued");
        Ok(())
    }

    /// Block until every write queued before this call has been appended.
    ///
    /// Returns at once if the worker is already stopped, since stopping
    /// drains the queue.
    pub fn flush(&self) {
        let Some(sender) = self.sender.lock().clone() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if sender.blocking_send(Task::Barrier(done_tx)).is_err() {
            return;
        }
        drop(sender);
        // An error means the worker is gone, and with it the queue
        let _ = done_rx.blocking_recv();
    }

    /// Stop accepting writes, let the worker drain the queue, and join it.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.join().is_err() {
            error!("deferred worker panicked");
        } else {
            debug!("deferred worker stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl Drop for DeferredWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut receiver: mpsc::Receiver<Task>) {
    while let Some(task) = receiver.blocking_recv() {
        match task {
            Task::Write(PendingWrite { flow, data }) => {
                trace!(
                    unit = flow.unit(),
                    priority = %flow.priority(),
                    bytes = data.len(),
                    "appending deferred write"
                );
                flow.complete_deferred(&data);
            }
            Task::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("deferred queue closed");
}
