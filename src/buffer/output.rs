//! Write-side stream view.

use std::collections::VecDeque;
use std::io::{self, Write};

use crate::buffer::pool::BufferPool;
use crate::buffer::{Buffer, Chunk};
use crate::error::Error;
use crate::metrics;
use crate::store::FileStore;

/// Outcome of one [`BufferOutputStream::drain_to`] invocation.
#[derive(Debug, Clone, Copy)]
pub struct Drain {
    /// Bytes the channel accepted.
    pub bytes: usize,
    /// True when the stream is now empty.
    pub completed: bool,
}

/// Append-side stream. Bytes land in pooled memory buffers until
/// `max_write_buffers` blocks are resident, then spill into file regions.
/// Draining consumes from the head regardless of medium.
#[derive(Debug)]
pub struct BufferOutputStream {
    chunks: VecDeque<Chunk>,
    mem_count: usize,
    max_write_buffers: usize,
}

impl BufferOutputStream {
    pub fn new(max_write_buffers: usize) -> BufferOutputStream {
        BufferOutputStream {
            chunks: VecDeque::new(),
            mem_count: 0,
            max_write_buffers,
        }
    }

    /// Bytes queued and not yet drained.
    pub fn pending(&self) -> usize {
        self.chunks.iter().map(Chunk::readable).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Resident memory buffers.
    pub fn buffer_count(&self) -> usize {
        self.mem_count
    }

    /// Queued spill regions.
    pub fn region_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c, Chunk::File(_)))
            .count()
    }

    /// Append `src`, topping up the current tail element first and growing
    /// the stream (memory first, then spill) as needed.
    pub fn write(
        &mut self,
        pool: &mut dyn BufferPool,
        store: &mut FileStore,
        src: &[u8],
    ) -> Result<(), Error> {
        let mut off = 0;
        while off < src.len() {
            let n = match self.chunks.back_mut() {
                Some(Chunk::Mem(buf)) if buf.writable() > 0 => {
                    let take = buf.writable().min(src.len() - off);
                    let widx = buf.write_index();
                    pool.data_mut(buf)[widx..widx + take]
                        .copy_from_slice(&src[off..off + take]);
                    buf.advance_write(take);
                    take
                }
                Some(Chunk::File(region)) => store.write(region, &src[off..])?,
                _ => 0,
            };
            off += n;
            if n == 0 {
                self.grow(pool, store)?;
            }
        }
        Ok(())
    }

    /// Hand a pooled buffer straight to the stream, avoiding a copy.
    pub fn push_buffer(&mut self, buf: Buffer) {
        self.mem_count += 1;
        self.chunks.push_back(Chunk::Mem(buf));
    }

    /// Write queued bytes into `chan`, bounded by `spin_count` successful
    /// writes. A would-block or zero-length write stops the drain with
    /// `completed == false` so the caller keeps write interest asserted.
    pub fn drain_to<C: Write>(
        &mut self,
        pool: &mut dyn BufferPool,
        store: &mut FileStore,
        chan: &mut C,
        spin_count: usize,
    ) -> Result<Drain, Error> {
        let mut total = 0;
        let mut spins = 0;
        while spins < spin_count {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let n = match chunk {
                Chunk::Mem(buf) => {
                    let ridx = buf.read_index();
                    let widx = buf.write_index();
                    match chan.write(&pool.data(buf)[ridx..widx]) {
                        Ok(n) => {
                            buf.advance_read(n);
                            n
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Chunk::File(region) => store.transfer_to(region, usize::MAX, chan)?,
            };
            let drained = chunk.readable() == 0;
            if drained {
                self.release_head(pool, store);
            }
            if n == 0 {
                if drained {
                    // an empty element went away; keep going
                    continue;
                }
                break;
            }
            total += n;
            spins += 1;
        }
        Ok(Drain {
            bytes: total,
            completed: self.chunks.is_empty(),
        })
    }

    /// Release every queued element back to its pool.
    pub(crate) fn release_all(&mut self, pool: &mut dyn BufferPool, store: &mut FileStore) {
        while !self.chunks.is_empty() {
            self.release_head(pool, store);
        }
    }

    fn grow(&mut self, pool: &mut dyn BufferPool, store: &mut FileStore) -> Result<(), Error> {
        if self.mem_count < self.max_write_buffers {
            let buf = pool.allocate()?;
            self.mem_count += 1;
            self.chunks.push_back(Chunk::Mem(buf));
        } else {
            let region = store.allocate()?;
            metrics::STORE_SPILLS.increment();
            self.chunks.push_back(Chunk::File(region));
        }
        Ok(())
    }

    fn release_head(&mut self, pool: &mut dyn BufferPool, store: &mut FileStore) {
        match self.chunks.pop_front() {
            Some(Chunk::Mem(buf)) => {
                self.mem_count -= 1;
                pool.release(buf);
            }
            Some(Chunk::File(region)) => store.release(region),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::SlabBufferPool;

    fn fixture(max_write_buffers: usize) -> (SlabBufferPool, FileStore, BufferOutputStream) {
        (
            SlabBufferPool::new(64 * 4096, 4096),
            FileStore::open(1 << 20, 4096).unwrap(),
            BufferOutputStream::new(max_write_buffers),
        )
    }

    #[test]
    fn spills_past_memory_budget() {
        let (mut pool, mut store, mut out) = fixture(2);
        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i & 0xff) as u8).collect();
        out.write(&mut pool, &mut store, &data).unwrap();

        assert_eq!(out.pending(), data.len());
        assert_eq!(out.buffer_count(), 2);
        // 64 KiB minus two 4 KiB memory blocks sits in the store
        assert_eq!(out.region_count(), 14);
        assert_eq!(store.size(), (64 - 8) * 1024);
    }

    #[test]
    fn drain_round_trips_across_spill_boundaries() {
        let (mut pool, mut store, mut out) = fixture(2);
        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        out.write(&mut pool, &mut store, &data).unwrap();

        let mut sink = Vec::new();
        loop {
            let drain = out.drain_to(&mut pool, &mut store, &mut sink, 16).unwrap();
            if drain.completed {
                break;
            }
            assert!(drain.bytes > 0);
        }
        assert_eq!(sink, data);
        // everything released: no pooled bytes, file shrunk back to zero
        assert_eq!(pool.current_bytes(), 0);
        assert_eq!(store.size(), 0);
        assert_eq!(store.file_len().unwrap(), 0);
    }

    #[test]
    fn memory_only_round_trip() {
        let (mut pool, mut store, mut out) = fixture(8);
        let data = b"a short frame".repeat(100);
        out.write(&mut pool, &mut store, &data).unwrap();
        assert_eq!(out.region_count(), 0);

        let mut sink = Vec::new();
        let drain = out
            .drain_to(&mut pool, &mut store, &mut sink, usize::MAX)
            .unwrap();
        assert!(drain.completed);
        assert_eq!(drain.bytes, data.len());
        assert_eq!(sink, data);
    }

    /// Accepts a bounded number of bytes per write, then would-block.
    struct Throttled {
        accepted: Vec<u8>,
        per_call: usize,
        calls_left: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.calls_left == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.calls_left -= 1;
            let n = buf.len().min(self.per_call);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drain_stops_at_would_block() {
        let (mut pool, mut store, mut out) = fixture(8);
        out.write(&mut pool, &mut store, &[9u8; 10_000]).unwrap();

        let mut chan = Throttled {
            accepted: Vec::new(),
            per_call: 1000,
            calls_left: 3,
        };
        let drain = out.drain_to(&mut pool, &mut store, &mut chan, 16).unwrap();
        assert_eq!(drain.bytes, 3000);
        assert!(!drain.completed);
        assert_eq!(out.pending(), 7000);
    }

    #[test]
    fn drain_bounded_by_spin_count() {
        let (mut pool, mut store, mut out) = fixture(8);
        out.write(&mut pool, &mut store, &[3u8; 10_000]).unwrap();

        let mut chan = Throttled {
            accepted: Vec::new(),
            per_call: 100,
            calls_left: usize::MAX,
        };
        let drain = out.drain_to(&mut pool, &mut store, &mut chan, 4).unwrap();
        assert_eq!(drain.bytes, 400);
        assert!(!drain.completed);
    }

    #[test]
    fn push_buffer_counts_toward_budget() {
        let (mut pool, mut store, mut out) = fixture(1);
        let mut buf = pool.allocate().unwrap();
        pool.data_mut(&buf)[..4].copy_from_slice(b"head");
        buf.advance_write(4);
        out.push_buffer(buf);
        assert_eq!(out.buffer_count(), 1);

        // the memory budget is already spent; new bytes spill
        out.write(&mut pool, &mut store, b"tail").unwrap();
        assert_eq!(out.region_count(), 1);

        let mut sink = Vec::new();
        let drain = out
            .drain_to(&mut pool, &mut store, &mut sink, usize::MAX)
            .unwrap();
        assert!(drain.completed);
        assert_eq!(sink, b"headtail");
    }
}
