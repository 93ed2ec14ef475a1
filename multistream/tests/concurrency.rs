use std::sync::{Arc, Barrier};
use std::thread;

use multistream::{Command, Config, Device, Priority, Session};

const THREADS: usize = 8;
const PER_THREAD: usize = 2500;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device() -> Arc<Device> {
    init_logging();
    Arc::new(
        Device::new(Config {
            units: 2,
            ..Config::default()
        })
        .unwrap(),
    )
}

fn blocking_session(device: &Arc<Device>, priority: Priority) -> Session {
    let session = device.open(0).unwrap();
    session.control(Command::SetPriority(priority)).unwrap();
    session.control(Command::SetBlockingTimeout(1000)).unwrap();
    session
}

/// Each thread writes `PER_THREAD` copies of its own tag byte at once
fn concurrent_writers(device: &Arc<Device>, priority: Priority) {
    let start = Arc::new(Barrier::new(THREADS));
    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let session = blocking_session(device, priority);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                session.write(&vec![b'a' + t as u8; PER_THREAD]).unwrap()
            })
        })
        .collect();
    for writer in writers {
        assert_eq!(writer.join().unwrap(), PER_THREAD);
    }
}

/// The buffered bytes must be whole, unbroken runs, one per writer
fn assert_unbroken_runs(data: &[u8]) {
    assert_eq!(data.len(), THREADS * PER_THREAD);
    let mut seen = Vec::new();
    for run in data.chunks(PER_THREAD) {
        let tag = run[0];
        assert!(run.iter().all(|&b| b == tag), "write of {tag} was split");
        assert!(!seen.contains(&tag), "tag {tag} appears twice");
        seen.push(tag);
    }
}

#[test]
fn test_concurrent_high_writers() {
    let device = device();
    concurrent_writers(&device, Priority::High);

    let unit = device.unit(0).unwrap();
    assert_eq!(unit.stats().high.buffered_bytes, THREADS * PER_THREAD);

    let reader = device.open(0).unwrap();
    assert_unbroken_runs(&reader.read(20480).unwrap());
}

#[test]
fn test_concurrent_low_writers() {
    let device = device();
    concurrent_writers(&device, Priority::Low);
    device.flush_deferred();

    let unit = device.unit(0).unwrap();
    let stats = unit.stats().low;
    assert_eq!(stats.buffered_bytes, THREADS * PER_THREAD);
    assert_eq!(stats.free_bytes, 20480 - THREADS * PER_THREAD);

    let reader = device.open(0).unwrap();
    reader.control(Command::SetPriority(Priority::Low)).unwrap();
    assert_unbroken_runs(&reader.read(20480).unwrap());
}

#[test]
fn test_writer_and_reader_stream_through_small_flow() {
    init_logging();
    let device = Arc::new(
        Device::new(Config {
            units: 1,
            chunk_size: 64,
            max_chunks: 2,
            ..Config::default()
        })
        .unwrap(),
    );
    let total = 50_000;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    for priority in Priority::ALL {
        let session = blocking_session(&device, priority);
        let writer = {
            let session = blocking_session(&device, priority);
            let data = data.clone();
            thread::spawn(move || {
                let mut sent = 0;
                while sent < data.len() {
                    let end = (sent + 100).min(data.len());
                    sent += session.write(&data[sent..end]).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < total {
            received.extend(session.read(77).unwrap());
        }

        writer.join().unwrap();
        assert_eq!(received, data, "{priority} stream corrupted");
        let stats = session.unit().stats();
        assert_eq!(stats.flow(priority).buffered_bytes, 0);
        assert_eq!(stats.flow(priority).free_bytes, 128);
    }
}
