//! Read-side stream view.

use std::collections::VecDeque;

use crate::buffer::pool::BufferPool;
use crate::buffer::{Buffer, Chunk};
use crate::error::Error;
use crate::store::{FileRegion, FileStore};

/// Ordered run of pooled buffers (and, rarely, spilled file regions)
/// exposed as one logical byte sequence. Consuming from the head advances
/// the current element's read cursor; drained elements are released back to
/// their pool in order.
#[derive(Debug, Default)]
pub struct BufferInputStream {
    chunks: VecDeque<Chunk>,
    mem_count: usize,
}

impl BufferInputStream {
    pub fn new() -> BufferInputStream {
        BufferInputStream::default()
    }

    /// Total unread bytes across all queued elements.
    pub fn available(&self) -> usize {
        self.chunks.iter().map(Chunk::readable).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Number of resident memory buffers; drives read backpressure.
    pub fn buffer_count(&self) -> usize {
        self.mem_count
    }

    pub(crate) fn push_buffer(&mut self, buf: Buffer) {
        self.mem_count += 1;
        self.chunks.push_back(Chunk::Mem(buf));
    }

    pub(crate) fn push_region(&mut self, region: FileRegion) {
        self.chunks.push_back(Chunk::File(region));
    }

    /// Tail buffer when it is a memory block with write room left.
    pub(crate) fn tail_buffer_with_room(&mut self) -> Option<&mut Buffer> {
        match self.chunks.back_mut() {
            Some(Chunk::Mem(buf)) if buf.writable() > 0 => Some(buf),
            _ => None,
        }
    }

    /// Copy up to `dst.len()` bytes out of the stream, crossing element
    /// boundaries. Returns the number of bytes copied.
    pub fn read(
        &mut self,
        pool: &mut dyn BufferPool,
        store: &mut FileStore,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let n = match chunk {
                Chunk::Mem(buf) => {
                    let take = buf.readable().min(dst.len() - copied);
                    let ridx = buf.read_index();
                    dst[copied..copied + take]
                        .copy_from_slice(&pool.data(buf)[ridx..ridx + take]);
                    buf.advance_read(take);
                    take
                }
                Chunk::File(region) => store.read(region, &mut dst[copied..])?,
            };
            let drained = chunk.readable() == 0;
            copied += n;
            if drained {
                self.release_head(pool, store);
            } else if n == 0 {
                break;
            }
        }
        Ok(copied)
    }

    /// Discard up to `n` bytes from the head of the stream. Returns how many
    /// were skipped.
    pub fn skip(
        &mut self,
        pool: &mut dyn BufferPool,
        store: &mut FileStore,
        n: usize,
    ) -> usize {
        let mut skipped = 0;
        while skipped < n {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            match chunk {
                Chunk::Mem(buf) => {
                    let take = buf.readable().min(n - skipped);
                    buf.advance_read(take);
                    skipped += take;
                }
                Chunk::File(region) => {
                    skipped += store.skip(region, n - skipped);
                }
            }
            if chunk.readable() == 0 {
                self.release_head(pool, store);
            } else {
                break;
            }
        }
        skipped
    }

    /// Take the head element out of the stream without copying, for
    /// handlers that forward pooled blocks as-is. Returns `None` when the
    /// head is not a memory buffer.
    pub fn take_head_buffer(&mut self) -> Option<Buffer> {
        if matches!(self.chunks.front(), Some(Chunk::Mem(_)))
            && let Some(Chunk::Mem(buf)) = self.chunks.pop_front()
        {
            self.mem_count -= 1;
            return Some(buf);
        }
        None
    }

    /// Release every queued element back to its pool.
    pub(crate) fn release_all(&mut self, pool: &mut dyn BufferPool, store: &mut FileStore) {
        while !self.chunks.is_empty() {
            self.release_head(pool, store);
        }
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

    fn fixture() -> (SlabBufferPool, FileStore) {
        (
            SlabBufferPool::new(8 * 64, 64),
            FileStore::open(1 << 20, 64).unwrap(),
        )
    }

    fn filled_buffer(pool: &mut SlabBufferPool, data: &[u8]) -> Buffer {
        let mut buf = pool.allocate().unwrap();
        pool.data_mut(&buf)[..data.len()].copy_from_slice(data);
        buf.advance_write(data.len());
        buf
    }

    #[test]
    fn read_crosses_element_boundaries() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"hello "));
        stream.push_buffer(filled_buffer(&mut pool, b"world"));
        assert_eq!(stream.available(), 11);
        assert_eq!(stream.buffer_count(), 2);

        let mut out = [0u8; 11];
        let n = stream.read(&mut pool, &mut store, &mut out).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
        // both elements drained and released
        assert_eq!(stream.buffer_count(), 0);
        assert_eq!(pool.current_bytes(), 0);
    }

    #[test]
    fn partial_read_keeps_head() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"abcdef"));

        let mut out = [0u8; 4];
        assert_eq!(stream.read(&mut pool, &mut store, &mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(stream.available(), 2);
        assert_eq!(pool.current_bytes(), 64);

        let mut rest = [0u8; 8];
        assert_eq!(stream.read(&mut pool, &mut store, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"ef");
        assert_eq!(pool.current_bytes(), 0);
    }

    #[test]
    fn reads_file_regions_in_order() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"mem|"));
        let mut region = store.allocate().unwrap();
        store.write(&mut region, b"file").unwrap();
        stream.push_region(region);

        let mut out = [0u8; 8];
        let n = stream.read(&mut pool, &mut store, &mut out).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&out, b"mem|file");
        // drained region was the top one, so the file shrank
        assert_eq!(store.file_len().unwrap(), 0);
    }

    #[test]
    fn skip_drops_bytes() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"0123456789"));
        assert_eq!(stream.skip(&mut pool, &mut store, 6), 6);

        let mut out = [0u8; 4];
        assert_eq!(stream.read(&mut pool, &mut store, &mut out).unwrap(), 4);
        assert_eq!(&out, b"6789");
    }

    #[test]
    fn take_head_buffer_hands_off_without_copy() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"zero-copy"));

        let buf = stream.take_head_buffer().unwrap();
        assert_eq!(stream.buffer_count(), 0);
        assert_eq!(buf.readable(), 9);
        // the stream no longer owns it; the caller releases
        assert_eq!(pool.current_bytes(), 64);
        pool.release(buf);
        let _ = &mut store;
    }

    #[test]
    fn release_all_returns_everything() {
        let (mut pool, mut store) = fixture();
        let mut stream = BufferInputStream::new();
        stream.push_buffer(filled_buffer(&mut pool, b"a"));
        stream.push_buffer(filled_buffer(&mut pool, b"b"));
        let region = store.allocate().unwrap();
        stream.push_region(region);

        stream.release_all(&mut pool, &mut store);
        assert_eq!(pool.current_bytes(), 0);
        assert_eq!(store.max_id(), 0);
        assert!(stream.is_empty());
    }
}
