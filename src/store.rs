//! The block-framed mmap append log (spec §3, §4.2).
//!
//! One store is one fixed-size mapped file: an 8-byte header (magic, total
//! size) followed by a packed sequence of `u32 length + payload` blocks. A
//! zero length prefix is the logical end of the store — writers never
//! produce one, so seeing it always means "nothing more was written here".
//!
//! Grounded on the teacher's `core/segment_writer.rs` for the bump-allocator
//! shape and `core/segment_cursor.rs` for the cursor walk, generalized from
//! the teacher's aligned/CRC'd `MessageHeader` records down to the bare
//! length-prefixed frame this queue actually uses.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{fatal, Error, Result};
use crate::mmap::MmapFile;

pub const MAGIC: u32 = 0xDEAD_BEEF;
pub const HEADER_LEN: usize = 8;
/// Minimum store size: header plus one minimal block frame (4-byte length,
/// zero payload) plus the zero tail sentinel.
pub const MIN_STORE_SIZE: usize = 16;

/// Threshold (in bytes advanced since the last async msync) past which a
/// write opportunistically kicks off a background flush. Chosen the same
/// way the teacher picks its roll-check thresholds: a round power-of-two
/// tuned for throughput, not a correctness boundary.
const SYNC_THRESHOLD: u32 = 4 * 1024 * 1024;
const PAGE_SIZE: u32 = 4096;

const SYNCING_BIT: u32 = 1 << 31;
const WRITER_MASK: u32 = !SYNCING_BIT;

/// Sentinel for "no block has been popped yet" — offset 0 is never a valid
/// block position since the first block starts at `HEADER_LEN`.
const READ_CURSOR_NONE: u32 = 0;

pub const DELETE_IF_EXISTS: u32 = 0x0001;

fn is_syncing(packed: u32) -> bool {
    packed & SYNCING_BIT != 0
}

fn writer_count(packed: u32) -> u32 {
    packed & WRITER_MASK
}

/// One fixed-size mmapped append log.
pub struct Store {
    mmap: MmapFile,
    capacity: usize,
    write_cursor: AtomicU32,
    read_cursor: AtomicU32,
    last_sync: AtomicU32,
    syncing_and_writers: AtomicU32,
    synced: AtomicBool,
}

impl Store {
    /// `create(size, base_dir, name, flags)`: exclusive-create (or truncate
    /// under `DELETE_IF_EXISTS`), `fallocate` to `size`, map, write the
    /// header, and arm runtime state in the *writable* phase.
    pub fn create(base_dir: &Path, name: &str, size: usize, flags: u32) -> Result<Arc<Self>> {
        if size < MIN_STORE_SIZE {
            return Err(Error::Unsupported("store size below minimum"));
        }
        let path = base_dir.join(name);
        let truncate_existing = flags & DELETE_IF_EXISTS != 0;
        let mut mmap = MmapFile::create(&path, size, truncate_existing)?;
        {
            let header = mmap.range_mut(0, HEADER_LEN)?;
            header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
            header[4..8].copy_from_slice(&(size as u32).to_le_bytes());
        }
        mmap.sync()?;
        Ok(Arc::new(Self {
            mmap,
            capacity: size,
            write_cursor: AtomicU32::new(HEADER_LEN as u32),
            read_cursor: AtomicU32::new(READ_CURSOR_NONE),
            last_sync: AtomicU32::new(HEADER_LEN as u32),
            syncing_and_writers: AtomicU32::new(SYNCING_BIT),
            synced: AtomicBool::new(true),
        }))
    }

    /// Opens an existing store. Header magic/size are verified; a mismatch
    /// is a fatal bad-format condition. Reopened stores always start
    /// *synced*, since only already-sealed segments are ever reopened
    /// (spec §4.3 "lazy reopen" only applies to CLOSED segments, which are
    /// by construction already synced).
    pub fn open(base_dir: &Path, name: &str) -> Result<Arc<Self>> {
        let path = base_dir.join(name);
        let mmap = MmapFile::open(&path)?;
        let header = mmap.as_slice();
        if header.len() < HEADER_LEN {
            fatal("store file shorter than header", &Error::BadFormat("truncated header"));
        }
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if magic != MAGIC {
            fatal("store header magic mismatch", &Error::BadFormat("bad magic"));
        }
        if size != mmap.len() {
            fatal("store header size mismatch", &Error::BadFormat("bad size"));
        }
        let write_cursor = recover_write_cursor(&mmap, size)?;
        Ok(Arc::new(Self {
            mmap,
            capacity: size,
            write_cursor: AtomicU32::new(write_cursor),
            read_cursor: AtomicU32::new(READ_CURSOR_NONE),
            last_sync: AtomicU32::new(write_cursor),
            syncing_and_writers: AtomicU32::new(SYNCING_BIT),
            synced: AtomicBool::new(true),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.write_cursor.load(Ordering::Acquire) as usize == HEADER_LEN
    }

    /// Appends `data` as one block. Returns the block's start offset on
    /// success, or `Ok(0)` to mean "store full or sealing — caller should
    /// sync and roll to a new segment" (spec §4.2 write path step 1-2).
    pub fn write(&self, data: &[u8]) -> Result<u32> {
        if data.is_empty() {
            return Err(Error::Unsupported("zero-length blocks are not permitted"));
        }
        let required = 4usize + data.len();
        if required > self.capacity - HEADER_LEN {
            if self.is_empty() {
                fatal(
                    "block larger than store capacity",
                    &Error::ProgrammerError("write exceeds store capacity"),
                );
            }
            return Ok(0);
        }

        if !self.register_writer() {
            return Ok(0); // sync in progress; caller retries
        }

        let offset = match self.reserve(required as u32) {
            Some(offset) => offset,
            None => {
                self.release_writer();
                return Ok(0); // store full
            }
        };

        let mut frame = Vec::with_capacity(required);
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(data);
        // SAFETY: `reserve` handed us an offset from a CAS bump allocator;
        // no other writer can have been given an overlapping range.
        unsafe {
            self.mmap.write_at(offset as usize, &frame)?;
        }

        self.maybe_async_sync(offset + required as u32);
        self.release_writer();
        Ok(offset)
    }

    fn register_writer(&self) -> bool {
        loop {
            let packed = self.syncing_and_writers.load(Ordering::Acquire);
            if is_syncing(packed) {
                return false;
            }
            let next = packed + 1;
            if self
                .syncing_and_writers
                .compare_exchange_weak(packed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_writer(&self) {
        self.syncing_and_writers.fetch_sub(1, Ordering::AcqRel);
    }

    fn reserve(&self, required: u32) -> Option<u32> {
        loop {
            let cur = self.write_cursor.load(Ordering::Acquire);
            let remaining = self.capacity as u32 - cur;
            if remaining < required {
                return None;
            }
            let next = cur + required;
            if self
                .write_cursor
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(cur);
            }
        }
    }

    fn maybe_async_sync(&self, new_pos: u32) {
        loop {
            let last = self.last_sync.load(Ordering::Acquire);
            if new_pos.saturating_sub(last) < SYNC_THRESHOLD {
                return;
            }
            let aligned = (new_pos / PAGE_SIZE) * PAGE_SIZE;
            if self
                .last_sync
                .compare_exchange_weak(last, aligned, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = self.mmap.flush_async_range(aligned as usize);
                return;
            }
        }
    }

    /// Transitions writable → sealing → synced (spec §4.2 sync path).
    /// Rejects syncing an empty store. Idempotent: a second call with no
    /// intervening writes observes `syncing` already set and `writers == 0`
    /// and simply re-does the msync/fsync, which has no observable effect.
    pub fn sync(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Unsupported("cannot sync an empty store"));
        }
        loop {
            let packed = self.syncing_and_writers.load(Ordering::Acquire);
            let sealed = packed | SYNCING_BIT;
            if self
                .syncing_and_writers
                .compare_exchange_weak(packed, sealed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        while writer_count(self.syncing_and_writers.load(Ordering::Acquire)) != 0 {
            std::hint::spin_loop();
        }
        self.mmap.sync()?;
        self.synced.store(true, Ordering::Release);
        Ok(())
    }

    fn read_len_at(&self, offset: u32) -> Result<u32> {
        if !self.is_synced() {
            return Err(Error::UnsyncedStore);
        }
        if offset as usize + 4 > self.capacity {
            return Err(Error::OutOfBounds);
        }
        let bytes = self.mmap.read_at(offset as usize, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn payload_at(&self, offset: u32, len: u32) -> Result<&[u8]> {
        self.mmap.read_at(offset as usize + 4, len as usize)
    }

    /// Shared, lock-free single-consumer hand-off (spec §4.2 "pop-cursor").
    /// Returns the `(block_start_offset, payload_len)` of the next
    /// unclaimed block, or `None` at end of store. Each block is handed to
    /// exactly one caller no matter how many threads race here.
    pub fn pop_cursor(&self) -> Result<Option<(u32, u32)>> {
        loop {
            let mut rc = self.read_cursor.load(Ordering::Acquire);
            if rc == READ_CURSOR_NONE {
                let start = HEADER_LEN as u32;
                match self.read_cursor.compare_exchange(
                    READ_CURSOR_NONE,
                    start,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => rc = start,
                    Err(_) => continue,
                }
            }
            if !self.is_synced() {
                return Err(Error::UnsyncedStore);
            }
            // A store that fills to within 4 bytes of capacity (the bump
            // allocator only guarantees `remaining >= required`, not a
            // trailing zero sentinel) has no readable length prefix at the
            // tail; that is still just "end of store", the same as reading
            // an explicit zero length.
            if rc as usize + 4 > self.capacity {
                return Ok(None);
            }
            let len = self.read_len_at(rc)?;
            if len == 0 {
                return Ok(None);
            }
            let next = rc + 4 + len;
            if self
                .read_cursor
                .compare_exchange(rc, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Some((rc, len)));
            }
        }
    }

    /// A thread-local, forward-only cursor for sequential or random-access
    /// walks over a synced store (spec §4.2 "Cursor").
    pub fn cursor(self: &Arc<Self>) -> Cursor {
        Cursor {
            store: Arc::clone(self),
            position: None,
            size: 0,
            next_offset: 0,
        }
    }
}

/// Scans forward from the header to find the first zero-length prefix,
/// used to recover `write_cursor` when reopening a store whose runtime
/// state was never persisted (spec §3: "volatile fields... recomputed on
/// open"). Only ever needed on stores reopened for writing, which this
/// queue's coordinator does not currently do (segments are reopened only
/// for reading, already sealed) — kept for completeness and for any future
/// caller that reopens a store mid-write.
fn recover_write_cursor(mmap: &MmapFile, capacity: usize) -> Result<u32> {
    let mut offset = HEADER_LEN;
    loop {
        if offset + 4 > capacity {
            return Ok(offset as u32);
        }
        let bytes = mmap.read_at(offset, 4)?;
        let len = u32::from_le_bytes(bytes.try_into().unwrap());
        if len == 0 {
            return Ok(offset as u32);
        }
        offset += 4 + len as usize;
        if offset > capacity {
            return Err(Error::Corrupt("block frame runs past end of store"));
        }
    }
}

pub struct Cursor {
    store: Arc<Store>,
    position: Option<u32>,
    size: u32,
    next_offset: u32,
}

impl Cursor {
    /// Seeks to `off`. Cursors are forward-only: seeking at or behind the
    /// current position fails with `InvalidSeekDirection`.
    pub fn seek(&mut self, off: u32) -> Result<()> {
        if !self.store.is_synced() {
            return Err(Error::UnsyncedStore);
        }
        if let Some(current) = self.position {
            if off <= current {
                return Err(Error::InvalidSeekDirection);
            }
        }
        if off as usize + 4 > self.store.capacity {
            return Err(Error::OutOfBounds);
        }
        let len = self.store.read_len_at(off)?;
        if len == 0 {
            return Err(Error::End);
        }
        self.position = Some(off);
        self.size = len;
        self.next_offset = off + 4 + len;
        Ok(())
    }

    /// Equivalent to `seek(next_offset)` with `OutOfBounds` remapped to
    /// `End`, since running off the mapped region after a valid block is
    /// just "no more data", not a caller error.
    pub fn advance(&mut self) -> Result<()> {
        if self.position.is_none() {
            return Err(Error::UninitialisedCursor);
        }
        match self.seek(self.next_offset) {
            Err(Error::OutOfBounds) => Err(Error::End),
            other => other,
        }
    }

    pub fn payload(&self) -> Result<&[u8]> {
        let off = self.position.ok_or(Error::UninitialisedCursor)?;
        self.store.payload_at(off, self.size)
    }

    pub fn size(&self) -> Result<u32> {
        self.position.ok_or(Error::UninitialisedCursor)?;
        Ok(self.size)
    }
}
