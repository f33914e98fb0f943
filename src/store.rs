//! File-backed spill store.
//!
//! Manages fixed-size regions inside one anonymous temporary file. Output
//! streams spill here once their memory budget is spent; regions are read
//! back positionally while draining toward the socket. Region `id` covers
//! file bytes `[id * region_size, (id + 1) * region_size)` and the file
//! length always equals `max_id * region_size`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

use crate::error::Error;

/// Hard upper bound for `store_size` (8 GiB).
pub const MAX_STORE_SIZE: u64 = 1 << 33;

// Per-call transfer granularity for the channel transfer paths.
const SCRATCH_LIMIT: usize = 64 * 1024;

/// A fixed-size slice of the store file, with read and write cursors
/// relative to the region start. Handles are released explicitly via
/// [`FileStore::release`].
#[derive(Debug)]
pub struct FileRegion {
    pub(crate) id: u64,
    read_index: usize,
    write_index: usize,
}

impl FileRegion {
    /// Region id; fixes the region's position in the file.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Written bytes not yet consumed.
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }
}

/// Pool of [`FileRegion`]s backed by a single temp file.
///
/// The file is created anonymously in the system temp directory and
/// disappears when the store is dropped (or the process exits).
pub struct FileStore {
    file: File,
    region_size: usize,
    store_size: u64,
    free: Vec<u64>,
    max_id: u64,
    size: u64,
    scratch: Vec<u8>,
    closed: bool,
}

impl FileStore {
    /// Open a store capped at `store_size` bytes, handing out regions of
    /// `region_size` bytes.
    pub fn open(store_size: u64, region_size: usize) -> Result<FileStore, Error> {
        let file = tempfile::tempfile()?;
        Ok(FileStore {
            file,
            region_size,
            store_size,
            free: Vec::new(),
            max_id: 0,
            size: 0,
            scratch: vec![0u8; region_size.min(SCRATCH_LIMIT)],
            closed: false,
        })
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Unread bytes across all live regions.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest region id ever handed out and not yet truncated away.
    pub fn max_id(&self) -> u64 {
        self.max_id
    }

    /// Current length of the backing file.
    pub fn file_len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Take an unused region, reusing a freed slot before extending the
    /// file. Fails when the store is closed or the cap is reached.
    pub fn allocate(&mut self) -> Result<FileRegion, Error> {
        if self.closed {
            return Err(Error::StoreAllocate("store closed"));
        }
        if let Some(id) = self.free.pop() {
            return Ok(FileRegion {
                id,
                read_index: 0,
                write_index: 0,
            });
        }
        if (self.max_id + 1) * self.region_size as u64 > self.store_size {
            return Err(Error::StoreAllocate("exceeds store size limit"));
        }
        let id = self.max_id;
        self.max_id += 1;
        // keep file length == max_id * region_size
        self.file.set_len(self.max_id * self.region_size as u64)?;
        Ok(FileRegion {
            id,
            read_index: 0,
            write_index: 0,
        })
    }

    /// Return a region. Releasing the top region shrinks the file
    /// (truncation failures are ignored); any other region goes back on the
    /// free list and its file bytes are reused by a later allocation.
    pub fn release(&mut self, region: FileRegion) {
        self.size -= region.readable() as u64;
        if region.id + 1 == self.max_id {
            self.max_id -= 1;
            let _ = self.file.set_len(self.max_id * self.region_size as u64);
        } else {
            self.free.push(region.id);
        }
    }

    /// Copy unread bytes from the region into `dst`. Returns 0 when the
    /// region has nothing left to read.
    pub fn read(&mut self, region: &mut FileRegion, dst: &mut [u8]) -> Result<usize, Error> {
        let n = region.readable().min(dst.len());
        if n == 0 {
            return Ok(0);
        }
        let pos = region.id * self.region_size as u64 + region.read_index as u64;
        read_exact_at(&self.file, &mut dst[..n], pos)?;
        region.read_index += n;
        self.size -= n as u64;
        Ok(n)
    }

    /// Append bytes into the region's free space. Returns how many bytes
    /// were taken from `src`.
    pub fn write(&mut self, region: &mut FileRegion, src: &[u8]) -> Result<usize, Error> {
        let n = (self.region_size - region.write_index).min(src.len());
        if n == 0 {
            return Ok(0);
        }
        let pos = region.id * self.region_size as u64 + region.write_index as u64;
        self.file.write_all_at(&src[..n], pos)?;
        region.write_index += n;
        self.size += n as u64;
        Ok(n)
    }

    /// Discard up to `count` unread bytes. Returns how many were skipped.
    pub fn skip(&mut self, region: &mut FileRegion, count: usize) -> usize {
        let n = region.readable().min(count);
        region.read_index += n;
        self.size -= n as u64;
        n
    }

    /// Move up to `count` unread bytes from the region into `dst`,
    /// typically a non-blocking socket. A would-block write reports 0; a
    /// short write advances only by what `dst` accepted.
    pub fn transfer_to(
        &mut self,
        region: &mut FileRegion,
        count: usize,
        dst: &mut impl Write,
    ) -> Result<usize, Error> {
        let want = region.readable().min(count).min(self.scratch.len());
        if want == 0 {
            return Ok(0);
        }
        let pos = region.id * self.region_size as u64 + region.read_index as u64;
        read_exact_at(&self.file, &mut self.scratch[..want], pos)?;
        let n = match dst.write(&self.scratch[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        region.read_index += n;
        self.size -= n as u64;
        Ok(n)
    }

    /// Fill the region's free space with up to `count` bytes pulled from
    /// `src`. A would-block read reports 0.
    pub fn transfer_from(
        &mut self,
        region: &mut FileRegion,
        count: usize,
        src: &mut impl Read,
    ) -> Result<usize, Error> {
        let want = (self.region_size - region.write_index)
            .min(count)
            .min(self.scratch.len());
        if want == 0 {
            return Ok(0);
        }
        let n = match src.read(&mut self.scratch[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(0);
        }
        let pos = region.id * self.region_size as u64 + region.write_index as u64;
        self.file.write_all_at(&self.scratch[..n], pos)?;
        region.write_index += n;
        self.size += n as u64;
        Ok(n)
    }

    /// Flush file contents (and metadata when asked) to stable storage.
    pub fn force(&mut self, metadata: bool) -> io::Result<()> {
        if metadata {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        }
    }

    /// Drop all regions and shrink the file to zero length. Further
    /// allocations fail.
    pub fn close(&mut self) {
        self.free.clear();
        self.max_id = 0;
        self.size = 0;
        self.closed = true;
        let _ = self.file.set_len(0);
    }
}

// A short positional read means the file was truncated underneath us.
fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> Result<(), Error> {
    file.read_exact_at(buf, pos).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "store truncated",
            ))
        } else {
            Error::Io(e)
        }
    })
}
