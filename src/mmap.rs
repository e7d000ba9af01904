//! Thin wrapper over a fixed-size file mapped read/write shared.
//!
//! Stores are always a known, fixed size: the header records it, and every
//! segment is allocated at that size up front. This wrapper never grows or
//! shrinks the mapping after creation.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Create a new file of exactly `len` bytes and map it. `existing`
    /// controls whether an existing file of the same name is truncated
    /// (`DELETE_IF_EXISTS`) or the create fails (`AlreadyExists`).
    pub fn create(path: &Path, len: usize, truncate_existing: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .create_new(!truncate_existing)
            .truncate(truncate_existing)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        fallocate(&file, len)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    /// Copy `bytes` into the mapping at `offset` through a raw pointer,
    /// bypassing the `&mut self` borrow `range_mut` requires.
    ///
    /// # Safety
    /// The caller must guarantee no other access overlaps
    /// `[offset, offset + bytes.len())` for the duration of this call. The
    /// store's bump allocator upholds this by handing every writer a
    /// disjoint byte range via CAS before it ever calls this.
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        let ptr = self.map.as_ptr() as *mut u8;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        Ok(())
    }

    /// Read `len` bytes at `offset` by copying out of the mapping.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synchronous msync of the whole mapping followed by fsync of the
    /// descriptor — the durability boundary the store's `sync()` relies on.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Asynchronous msync of `[0, up_to)`, used by the store's background
    /// advance of `last_sync` during a long write run.
    pub fn flush_async_range(&self, up_to: usize) -> Result<()> {
        let up_to = up_to.min(self.len);
        self.map.flush_async_range(0, up_to)?;
        Ok(())
    }
}

#[cfg(unix)]
fn fallocate(file: &File, len: usize) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    // posix_fallocate is not supported on all filesystems (e.g. tmpfs
    // returns EOPNOTSUPP/EINVAL); set_len() above already gave us a
    // correctly-sized sparse file, so a fallocate failure here is advisory.
    let _ = rc;
    Ok(())
}

#[cfg(not(unix))]
fn fallocate(_file: &File, _len: usize) -> Result<()> {
    Ok(())
}
