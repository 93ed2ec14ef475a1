//! Chunked byte store for one flow
//!
//! Bytes are kept in fixed-size chunks chained in FIFO order. Chunks live in
//! an arena and link to each other by index; slots of reclaimed chunks go to
//! a free list and are reused by later appends.
//!
//! The store keeps no capacity accounting of its own. Callers decide how
//! many bytes may be appended and consumed, and must hold the flow's gate.

use crate::error::{Error, Result};

/// Index of a chunk in the arena
pub type ChunkId = usize;

#[derive(Debug)]
struct Chunk {
    /// Filled bytes; capacity is reserved up front to the chunk size
    data: Vec<u8>,
    read_cursor: usize,
    next: Option<ChunkId>,
}

impl Chunk {
    fn unread(&self) -> usize {
        self.data.len() - self.read_cursor
    }
}

/// FIFO list of fixed-size chunks
///
/// # Example
///
/// ```
/// use multistream::io::ChunkStore;
///
/// let mut store = ChunkStore::with_first_chunk(4).unwrap();
/// assert_eq!(store.append(b"hello").unwrap(), 5);
/// assert_eq!(store.live_chunks(), 2);
///
/// assert_eq!(store.consume(4).unwrap(), b"hell");
/// assert_eq!(store.live_chunks(), 1);
/// ```
#[derive(Debug)]
pub struct ChunkStore {
    chunk_size: usize,
    slots: Vec<Chunk>,
    free_slots: Vec<ChunkId>,
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
    live: usize,
    unread: usize,
}

impl ChunkStore {
    /// Create an empty store with no chunks allocated
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `chunk_size` is zero.
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        Ok(Self {
            chunk_size,
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            live: 0,
            unread: 0,
        })
    }

    /// Create a store with one empty chunk ready for writing
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `chunk_size` is zero and
    /// [`Error::OutOfMemory`] if the chunk cannot be allocated.
    pub fn with_first_chunk(chunk_size: usize) -> Result<Self> {
        let mut store = Self::new(chunk_size)?;
        let id = store.alloc_chunk()?;
        store.link(id);
        Ok(store)
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks currently linked into the list
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        self.live
    }

    /// Unread bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.unread
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    /// Append all of `bytes`, growing the list as needed.
    ///
    /// The chunks the append needs are allocated before any byte is copied,
    /// so on failure the store is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if a chunk cannot be allocated.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let room = self.tail.map_or(0, |id| self.chunk_size - self.slots[id].data.len());
        let needed = bytes.len().saturating_sub(room).div_ceil(self.chunk_size);

        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(needed)
            .map_err(|_| Error::OutOfMemory)?;
        for _ in 0..needed {
            match self.alloc_chunk() {
                Ok(id) => fresh.push(id),
                Err(e) => {
                    for id in fresh {
                        self.release(id);
                    }
                    return Err(e);
                }
            }
        }
        for id in fresh {
            self.link(id);
        }

        // Start at the first chunk with room: the old tail, or the first fresh one
        let mut cursor = self.head;
        while let Some(id) = cursor {
            if self.slots[id].data.len() < self.chunk_size {
                break;
            }
            cursor = self.slots[id].next;
        }

        let mut written = 0;
        while let Some(id) = cursor {
            if written == bytes.len() {
                break;
            }
            let chunk = &mut self.slots[id];
            let n = (self.chunk_size - chunk.data.len()).min(bytes.len() - written);
            chunk.data.extend_from_slice(&bytes[written..written + n]);
            written += n;
            cursor = chunk.next;
        }

        self.unread += written;
        Ok(written)
    }

    /// Read up to `max_len` bytes from the head of the list.
    ///
    /// Chunks that are full and completely read are unlinked after the sweep.
    /// When that would empty the list, the last such chunk is reset and kept
    /// as the head instead, so an idle store holds exactly one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the output buffer cannot be allocated.
    pub fn consume(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = max_len.min(self.unread);
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;

        let mut drained = 0;
        let mut cursor = self.head;
        while out.len() < len {
            let Some(id) = cursor else { break };
            let chunk = &mut self.slots[id];
            let n = chunk.unread().min(len - out.len());
            out.extend_from_slice(&chunk.data[chunk.read_cursor..chunk.read_cursor + n]);
            chunk.read_cursor += n;
            if chunk.read_cursor == self.chunk_size {
                drained += 1;
                cursor = chunk.next;
            } else {
                break;
            }
        }

        self.unread -= out.len();
        self.reclaim(drained);
        Ok(out)
    }

    /// Unlink `count` exhausted chunks from the head
    fn reclaim(&mut self, count: usize) {
        for _ in 0..count {
            let Some(id) = self.head else { return };
            let next = self.slots[id].next;
            if next.is_none() {
                let chunk = &mut self.slots[id];
                chunk.data.clear();
                chunk.read_cursor = 0;
                log::trace!("chunks.reclaim: reset sole chunk {id}");
                return;
            }
            self.head = next;
            self.release(id);
            self.live -= 1;
            log::trace!("chunks.reclaim: released chunk {id}");
        }
    }

    fn alloc_chunk(&mut self) -> Result<ChunkId> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.chunk_size)
            .map_err(|_| Error::OutOfMemory)?;
        let chunk = Chunk {
            data,
            read_cursor: 0,
            next: None,
        };

        if let Some(id) = self.free_slots.pop() {
            self.slots[id] = chunk;
            return Ok(id);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.slots.push(chunk);
        Ok(self.slots.len() - 1)
    }

    /// Append an allocated chunk to the tail of the list
    fn link(&mut self, id: ChunkId) {
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.live += 1;
    }

    /// Drop the chunk's memory and return its slot to the free list
    fn release(&mut self, id: ChunkId) {
        self.slots[id] = Chunk {
            data: Vec::new(),
            read_cursor: 0,
            next: None,
        };
        self.free_slots.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = ChunkStore::with_first_chunk(8).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.live_chunks(), 1);
        assert_eq!(ChunkStore::new(8).unwrap().live_chunks(), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        assert!(matches!(ChunkStore::new(0), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            ChunkStore::with_first_chunk(0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_append_fills_tail_before_allocating() {
        let mut store = ChunkStore::with_first_chunk(8).unwrap();
        store.append(b"abc").unwrap();
        store.append(b"defgh").unwrap();
        assert_eq!(store.live_chunks(), 1);
        store.append(b"i").unwrap();
        assert_eq!(store.live_chunks(), 2);
        assert_eq!(store.len(), 9);
    }

    #[test]
    fn test_append_into_empty_list() {
        let mut store = ChunkStore::new(4).unwrap();
        assert_eq!(store.append(b"0123456789").unwrap(), 10);
        assert_eq!(store.live_chunks(), 3);
        assert_eq!(store.consume(10).unwrap(), b"0123456789");
    }

    #[test]
    fn test_consume_spans_chunks_in_order() {
        let mut store = ChunkStore::with_first_chunk(16).unwrap();
        let data = pattern(100);
        store.append(&data).unwrap();

        let mut out = store.consume(37).unwrap();
        out.extend(store.consume(1000).unwrap());
        assert_eq!(out, data);
        assert!(store.is_empty());
    }

    #[test]
    fn test_partial_read_keeps_head() {
        let mut store = ChunkStore::with_first_chunk(4).unwrap();
        store.append(b"abcdef").unwrap();
        assert_eq!(store.consume(3).unwrap(), b"abc");
        assert_eq!(store.live_chunks(), 2);
        assert_eq!(store.consume(1).unwrap(), b"d");
        assert_eq!(store.live_chunks(), 1);
    }

    #[test]
    fn test_reclaim_returns_to_single_chunk() {
        let mut store = ChunkStore::with_first_chunk(4).unwrap();
        store.append(&pattern(16)).unwrap();
        assert_eq!(store.live_chunks(), 4);
        store.consume(16).unwrap();
        assert_eq!(store.live_chunks(), 1);

        // The kept chunk is writable again
        store.append(b"xy").unwrap();
        assert_eq!(store.consume(2).unwrap(), b"xy");
    }

    #[test]
    fn test_slots_are_reused() {
        let mut store = ChunkStore::with_first_chunk(4).unwrap();
        for _ in 0..10 {
            store.append(&pattern(12)).unwrap();
            store.consume(12).unwrap();
        }
        assert!(store.slots.len() <= 4);
    }
}
