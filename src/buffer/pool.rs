//! Fixed-size block pools with a hard byte budget.
//!
//! Two interchangeable implementations: [`SlabBufferPool`] slices blocks out
//! of one contiguous allocation, [`HeapBufferPool`] allocates each block on
//! demand and frees it on final release. Both keep a per-slot reference
//! count so a block can be shared between the input and output paths.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::metrics;

/// Default block size when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

// Pools get process-unique tags so a handle can be matched to its pool.
static NEXT_POOL_TAG: AtomicU32 = AtomicU32::new(1);

fn next_pool_tag() -> u32 {
    NEXT_POOL_TAG.fetch_add(1, Ordering::Relaxed)
}

/// Fixed-size block allocator with a capped byte budget.
///
/// `current_bytes()` grows by exactly `buffer_size()` per allocation and
/// shrinks by the same when a block's last reference is released, so
/// `current_bytes() <= pool_size()` always holds.
pub trait BufferPool {
    /// Take a block. Fails when the byte budget is spent or the pool is
    /// closed.
    fn allocate(&mut self) -> Result<Buffer, Error>;

    /// Duplicate a handle, bumping the block's reference count. The copy
    /// starts with the same cursors; cursors move independently afterwards.
    fn retain(&mut self, buf: &Buffer) -> Buffer;

    /// Drop one reference. The block returns to the free list when the last
    /// reference goes away. Releasing a handle from another pool is a no-op
    /// apart from a warning.
    fn release(&mut self, buf: Buffer);

    /// The full block for `buf`.
    fn data(&self, buf: &Buffer) -> &[u8];

    fn data_mut(&mut self, buf: &Buffer) -> &mut [u8];

    fn buffer_size(&self) -> usize;

    /// `log2(buffer_size)`.
    fn buffer_size_shift(&self) -> u32;

    fn pool_size(&self) -> u64;

    fn current_bytes(&self) -> u64;

    fn available(&self) -> u64 {
        self.pool_size() - self.current_bytes()
    }

    fn is_open(&self) -> bool;

    /// Mark the pool closed; further allocations fail, releases still work.
    fn close(&mut self);
}

/// Pool backed by one contiguous slab sliced into `pool_size / buffer_size`
/// blocks. Handles are indexed views; no per-buffer heap traffic after
/// construction.
pub struct SlabBufferPool {
    tag: u32,
    backing: Vec<u8>,
    buffer_size: usize,
    buffer_size_shift: u32,
    pool_size: u64,
    current_bytes: u64,
    free: Vec<u32>,
    refs: Vec<u32>,
    closed: bool,
}

impl SlabBufferPool {
    /// Create a pool with at most `pool_size` bytes of backing, rounded down
    /// to a whole number of `buffer_size` blocks.
    ///
    /// # Panics
    ///
    /// Panics when `buffer_size` is not a power of two or `pool_size` holds
    /// less than one block. [`Config::validate`](crate::config::Config::validate)
    /// rejects such values up front.
    pub fn new(pool_size: u64, buffer_size: usize) -> SlabBufferPool {
        assert!(
            buffer_size.is_power_of_two(),
            "buffer_size must be a power of two"
        );
        assert!(
            pool_size >= buffer_size as u64,
            "pool_size smaller than one block"
        );
        let count = (pool_size / buffer_size as u64) as usize;
        SlabBufferPool {
            tag: next_pool_tag(),
            backing: vec![0u8; count * buffer_size],
            buffer_size,
            buffer_size_shift: buffer_size.trailing_zeros(),
            pool_size: (count * buffer_size) as u64,
            current_bytes: 0,
            free: (0..count as u32).rev().collect(),
            refs: vec![0; count],
            closed: false,
        }
    }
}

impl BufferPool for SlabBufferPool {
    fn allocate(&mut self) -> Result<Buffer, Error> {
        if self.closed {
            return Err(Error::BufferAllocate("pool closed"));
        }
        let Some(id) = self.free.pop() else {
            metrics::POOL_EXHAUSTED.increment();
            return Err(Error::BufferAllocate("exceeds pool size limit"));
        };
        self.refs[id as usize] = 1;
        self.current_bytes += self.buffer_size as u64;
        Ok(Buffer::new(self.tag, id, self.buffer_size))
    }

    fn retain(&mut self, buf: &Buffer) -> Buffer {
        debug_assert_eq!(buf.pool_tag, self.tag);
        debug_assert!(self.refs[buf.id as usize] > 0);
        self.refs[buf.id as usize] += 1;
        buf.duplicate()
    }

    fn release(&mut self, buf: Buffer) {
        if buf.pool_tag != self.tag {
            warn!(id = buf.id, "buffer not allocated from this pool");
            return;
        }
        let slot = buf.id as usize;
        if self.refs[slot] == 0 {
            warn!(id = buf.id, "release of already-free buffer");
            return;
        }
        self.refs[slot] -= 1;
        if self.refs[slot] == 0 {
            self.current_bytes -= self.buffer_size as u64;
            self.free.push(buf.id);
        }
    }

    fn data(&self, buf: &Buffer) -> &[u8] {
        debug_assert_eq!(buf.pool_tag, self.tag);
        let start = (buf.id as usize) << self.buffer_size_shift;
        &self.backing[start..start + self.buffer_size]
    }

    fn data_mut(&mut self, buf: &Buffer) -> &mut [u8] {
        debug_assert_eq!(buf.pool_tag, self.tag);
        let start = (buf.id as usize) << self.buffer_size_shift;
        &mut self.backing[start..start + self.buffer_size]
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn buffer_size_shift(&self) -> u32 {
        self.buffer_size_shift
    }

    fn pool_size(&self) -> u64 {
        self.pool_size
    }

    fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Pool that allocates each block on demand and drops it on final release.
/// Slot ids are recycled through a free list; block memory is not retained.
pub struct HeapBufferPool {
    tag: u32,
    blocks: Vec<Option<Box<[u8]>>>,
    buffer_size: usize,
    buffer_size_shift: u32,
    pool_size: u64,
    current_bytes: u64,
    free: Vec<u32>,
    refs: Vec<u32>,
    closed: bool,
}

impl HeapBufferPool {
    /// Create a pool capped at `pool_size` bytes of live blocks.
    ///
    /// # Panics
    ///
    /// Same preconditions as [`SlabBufferPool::new`].
    pub fn new(pool_size: u64, buffer_size: usize) -> HeapBufferPool {
        assert!(
            buffer_size.is_power_of_two(),
            "buffer_size must be a power of two"
        );
        assert!(
            pool_size >= buffer_size as u64,
            "pool_size smaller than one block"
        );
        HeapBufferPool {
            tag: next_pool_tag(),
            blocks: Vec::new(),
            buffer_size,
            buffer_size_shift: buffer_size.trailing_zeros(),
            pool_size,
            current_bytes: 0,
            free: Vec::new(),
            refs: Vec::new(),
            closed: false,
        }
    }
}

impl BufferPool for HeapBufferPool {
    fn allocate(&mut self) -> Result<Buffer, Error> {
        if self.closed {
            return Err(Error::BufferAllocate("pool closed"));
        }
        if self.current_bytes + self.buffer_size as u64 > self.pool_size {
            metrics::POOL_EXHAUSTED.increment();
            return Err(Error::BufferAllocate("exceeds pool size limit"));
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.blocks.push(None);
                self.refs.push(0);
                (self.blocks.len() - 1) as u32
            }
        };
        self.blocks[id as usize] = Some(vec![0u8; self.buffer_size].into_boxed_slice());
        self.refs[id as usize] = 1;
        self.current_bytes += self.buffer_size as u64;
        Ok(Buffer::new(self.tag, id, self.buffer_size))
    }

    fn retain(&mut self, buf: &Buffer) -> Buffer {
        debug_assert_eq!(buf.pool_tag, self.tag);
        debug_assert!(self.refs[buf.id as usize] > 0);
        self.refs[buf.id as usize] += 1;
        buf.duplicate()
    }

    fn release(&mut self, buf: Buffer) {
        if buf.pool_tag != self.tag {
            warn!(id = buf.id, "buffer not allocated from this pool");
            return;
        }
        let slot = buf.id as usize;
        if self.refs[slot] == 0 {
            warn!(id = buf.id, "release of already-free buffer");
            return;
        }
        self.refs[slot] -= 1;
        if self.refs[slot] == 0 {
            self.blocks[slot] = None;
            self.current_bytes -= self.buffer_size as u64;
            self.free.push(buf.id);
        }
    }

    fn data(&self, buf: &Buffer) -> &[u8] {
        debug_assert_eq!(buf.pool_tag, self.tag);
        match &self.blocks[buf.id as usize] {
            Some(block) => block,
            None => &[],
        }
    }

    fn data_mut(&mut self, buf: &Buffer) -> &mut [u8] {
        debug_assert_eq!(buf.pool_tag, self.tag);
        match &mut self.blocks[buf.id as usize] {
            Some(block) => block,
            None => &mut [],
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn buffer_size_shift(&self) -> u32 {
        self.buffer_size_shift
    }

    fn pool_size(&self) -> u64 {
        self.pool_size
    }

    fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Vec<Box<dyn BufferPool>> {
        vec![
            Box::new(SlabBufferPool::new(4 * 128, 128)),
            Box::new(HeapBufferPool::new(4 * 128, 128)),
        ]
    }

    #[test]
    fn conservation() {
        for mut pool in pools() {
            assert_eq!(pool.current_bytes(), 0);
            let a = pool.allocate().unwrap();
            let b = pool.allocate().unwrap();
            assert_eq!(pool.current_bytes(), 256);
            pool.release(a);
            assert_eq!(pool.current_bytes(), 128);
            pool.release(b);
            assert_eq!(pool.current_bytes(), 0);
            assert_eq!(pool.available(), pool.pool_size());
        }
    }

    #[test]
    fn exhaustion() {
        for mut pool in pools() {
            let held: Vec<Buffer> = (0..4).map(|_| pool.allocate().unwrap()).collect();
            assert!(matches!(
                pool.allocate(),
                Err(Error::BufferAllocate(_))
            ));
            for buf in held {
                pool.release(buf);
            }
            assert!(pool.allocate().is_ok());
        }
    }

    #[test]
    fn retain_keeps_block_alive() {
        for mut pool in pools() {
            let mut a = pool.allocate().unwrap();
            let widx = a.write_index();
            pool.data_mut(&a)[widx..widx + 5].copy_from_slice(b"hello");
            a.advance_write(5);

            let b = pool.retain(&a);
            pool.release(a);
            // still one reference; the bytes must survive
            assert_eq!(pool.current_bytes(), 128);
            assert_eq!(&pool.data(&b)[b.read_index()..b.write_index()], b"hello");
            pool.release(b);
            assert_eq!(pool.current_bytes(), 0);
        }
    }

    #[test]
    fn foreign_release_is_noop() {
        let mut a = SlabBufferPool::new(2 * 128, 128);
        let mut b = SlabBufferPool::new(2 * 128, 128);
        let buf = a.allocate().unwrap();
        b.release(buf);
        // a still owns the block
        assert_eq!(a.current_bytes(), 128);
        assert_eq!(b.current_bytes(), 0);
    }

    #[test]
    fn closed_pool_rejects_allocation() {
        for mut pool in pools() {
            let a = pool.allocate().unwrap();
            pool.close();
            assert!(!pool.is_open());
            assert!(matches!(
                pool.allocate(),
                Err(Error::BufferAllocate(_))
            ));
            // releases still drain the budget
            pool.release(a);
            assert_eq!(pool.current_bytes(), 0);
        }
    }

    #[test]
    fn slab_blocks_do_not_alias() {
        let mut pool = SlabBufferPool::new(2 * 128, 128);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.data_mut(&a).fill(0xaa);
        pool.data_mut(&b).fill(0xbb);
        assert!(pool.data(&a).iter().all(|&x| x == 0xaa));
        assert!(pool.data(&b).iter().all(|&x| x == 0xbb));
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn size_shift_matches() {
        let pool = SlabBufferPool::new(1 << 20, 4096);
        assert_eq!(pool.buffer_size_shift(), 12);
        assert_eq!(1usize << pool.buffer_size_shift(), pool.buffer_size());
    }
}
