//! The segment ring (spec §4.3): a bounded circular buffer of segments,
//! each advancing through `Free -> Writing -> Closed -> Reading -> Free`.
//!
//! One reader-writer lock protects `head`, `tail` and every slot's `state`;
//! each slot's refcount lives in a separate atomic array so `get`/`release`
//! only ever need a read lock (refcount mutation doesn't race state
//! mutation under the same lock discipline the teacher's
//! `core/segment_store.rs::ReaderMeta` uses for its double-buffered slots).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{fatal, Error, Result};
use crate::segment::{segment_file_name, Segment, SegmentState};
use crate::store::Store;

/// Power-of-two slot count, matching the original's `MAX_SEGMENTS`.
pub const MAX_SEGMENTS: u32 = 32 * 1024;

struct RingInner {
    head: u32,
    tail: u32,
    slots: Vec<Segment>,
}

pub struct SegmentRing {
    base_dir: PathBuf,
    name_prefix: String,
    segment_size: usize,
    inner: RwLock<RingInner>,
    refcounts: Vec<AtomicU32>,
}

fn slot_index(segment_number: u32) -> usize {
    (segment_number % MAX_SEGMENTS) as usize
}

impl SegmentRing {
    /// A brand-new ring with no segments allocated.
    pub fn new(base_dir: PathBuf, name_prefix: String, segment_size: usize) -> Self {
        let slots = (0..MAX_SEGMENTS).map(Segment::free).collect();
        SegmentRing {
            base_dir,
            name_prefix,
            segment_size,
            inner: RwLock::new(RingInner {
                head: 0,
                tail: 0,
                slots,
            }),
            refcounts: (0..MAX_SEGMENTS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Recovery-on-open (spec §4.4.5 step 2): segments `[sync_tail,
    /// sync_head)` are known-durable but are entered as `Closed` without
    /// reopening their stores — a reader will lazily reopen them the first
    /// time it's actually asked for one.
    pub fn recover(
        base_dir: PathBuf,
        name_prefix: String,
        segment_size: usize,
        sync_tail: u32,
        sync_head: u32,
    ) -> Self {
        let mut slots: Vec<Segment> = (0..MAX_SEGMENTS).map(Segment::free).collect();
        let mut n = sync_tail;
        while n != sync_head {
            slots[slot_index(n)] = Segment {
                segment_number: n,
                state: SegmentState::Closed,
                store: None,
            };
            n = n.wrapping_add(1);
        }
        SegmentRing {
            base_dir,
            name_prefix,
            segment_size,
            inner: RwLock::new(RingInner {
                head: sync_head,
                tail: sync_tail,
                slots,
            }),
            refcounts: (0..MAX_SEGMENTS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn head(&self) -> u32 {
        self.inner.read().unwrap().head
    }

    pub fn tail(&self) -> u32 {
        self.inner.read().unwrap().tail
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.head == inner.tail
    }

    /// Allocates segment `n`, which must equal the current `head`.
    /// `n < head` is tolerated as a no-op (a racing caller lost the
    /// allocate to someone else); `n > head` is a programmer error.
    pub fn allocate(&self, n: u32, create_flags: u32) -> Result<()> {
        {
            let inner = self.inner.read().unwrap();
            if n < inner.head {
                return Ok(());
            }
            if n > inner.head {
                fatal(
                    "ring.allocate called out of order",
                    &Error::ProgrammerError("allocate(n) with n > head"),
                );
            }
        }
        let mut inner = self.inner.write().unwrap();
        // Re-check under the write lock: another thread may have won the
        // allocate race between our read-lock check and taking the write lock.
        if n < inner.head {
            return Ok(());
        }
        if n > inner.head {
            fatal(
                "ring.allocate called out of order",
                &Error::ProgrammerError("allocate(n) with n > head"),
            );
        }
        let next_head = inner.head.wrapping_add(1);
        if slot_index(next_head) == slot_index(inner.tail) {
            fatal(
                "segment ring exhausted",
                &Error::ProgrammerError("segment ring has no free slots"),
            );
        }
        let store = Store::create(
            &self.base_dir,
            &segment_file_name(&self.name_prefix, n),
            self.segment_size,
            create_flags,
        )?;
        let idx = slot_index(n);
        inner.slots[idx] = Segment {
            segment_number: n,
            state: SegmentState::Writing,
            store: Some(store),
        };
        self.refcounts[idx].store(0, Ordering::Release);
        inner.head = next_head;
        Ok(())
    }

    pub fn get_for_writing(&self, n: u32) -> Option<Arc<Store>> {
        let inner = self.inner.read().unwrap();
        if !in_range(inner.tail, inner.head, n) {
            return None;
        }
        let idx = slot_index(n);
        let slot = &inner.slots[idx];
        if slot.segment_number != n || slot.state != SegmentState::Writing {
            return None;
        }
        let store = slot.store.clone();
        self.refcounts[idx].fetch_add(1, Ordering::AcqRel);
        store
    }

    /// Bumps refcount and returns the store for segment `n`, lazily
    /// reopening a `Closed` segment's store under the write lock if needed.
    pub fn get_for_reading(&self, n: u32) -> Result<Option<Arc<Store>>> {
        {
            let inner = self.inner.read().unwrap();
            if !in_range(inner.tail, inner.head, n) {
                return Ok(None);
            }
            let idx = slot_index(n);
            let slot = &inner.slots[idx];
            if slot.segment_number == n && slot.state == SegmentState::Reading {
                let store = slot.store.clone();
                self.refcounts[idx].fetch_add(1, Ordering::AcqRel);
                return Ok(store);
            }
            if slot.segment_number != n || slot.state != SegmentState::Closed {
                return Ok(None);
            }
        }
        let mut inner = self.inner.write().unwrap();
        if !in_range(inner.tail, inner.head, n) {
            return Ok(None);
        }
        let idx = slot_index(n);
        let slot = &mut inner.slots[idx];
        if slot.segment_number != n {
            return Ok(None);
        }
        match slot.state {
            SegmentState::Reading => {
                let store = slot.store.clone();
                self.refcounts[idx].fetch_add(1, Ordering::AcqRel);
                Ok(store)
            }
            SegmentState::Closed => {
                let store = Store::open(&self.base_dir, &segment_file_name(&self.name_prefix, n))?;
                slot.store = Some(Arc::clone(&store));
                slot.state = SegmentState::Reading;
                self.refcounts[idx].fetch_add(1, Ordering::AcqRel);
                Ok(Some(store))
            }
            _ => Ok(None),
        }
    }

    pub fn release_for_writing(&self, n: u32) {
        self.release(n, SegmentState::Writing, "release_for_writing");
    }

    pub fn release_for_reading(&self, n: u32) {
        self.release(n, SegmentState::Reading, "release_for_reading");
    }

    fn release(&self, n: u32, expected: SegmentState, op: &'static str) {
        let inner = self.inner.read().unwrap();
        let idx = slot_index(n);
        let slot = &inner.slots[idx];
        if slot.segment_number != n || slot.state != expected {
            drop(inner);
            fatal(
                "release called on segment in unexpected state",
                &Error::ProgrammerError(op),
            );
        }
        drop(inner);
        self.refcounts[idx].fetch_sub(1, Ordering::AcqRel);
    }

    /// Requires `Writing` state and a zero refcount. On success the store
    /// is dropped (mmap + descriptor released) and the slot becomes
    /// `Closed`; the file itself is untouched.
    pub fn close(&self, n: u32) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let idx = slot_index(n);
        let slot = &mut inner.slots[idx];
        if slot.segment_number != n || slot.state != SegmentState::Writing {
            return Err(Error::Unsupported("segment not in writing state"));
        }
        if self.refcounts[idx].load(Ordering::Acquire) != 0 {
            return Err(Error::Unsupported("segment still has outstanding writers"));
        }
        slot.store = None;
        slot.state = SegmentState::Closed;
        Ok(())
    }

    /// Walks `tail` forward destroying every contiguous `Reading`,
    /// zero-refcount segment up to and including `n`. Returns the new
    /// tail. Idempotent: a caller that loses the race to free simply
    /// observes tail already past where it wanted to go.
    pub fn free_up_to(&self, n: u32) -> u32 {
        let mut inner = self.inner.write().unwrap();
        loop {
            if !before_or_eq(inner.tail, n) {
                break;
            }
            let idx = slot_index(inner.tail);
            let slot = &inner.slots[idx];
            if slot.segment_number != inner.tail || slot.state != SegmentState::Reading {
                break;
            }
            if self.refcounts[idx].load(Ordering::Acquire) != 0 {
                break;
            }
            let _ = std::fs::remove_file(
                self.base_dir
                    .join(segment_file_name(&self.name_prefix, inner.tail)),
            );
            let freed = inner.tail;
            inner.slots[idx] = Segment::free(freed);
            inner.tail = inner.tail.wrapping_add(1);
        }
        inner.tail
    }
}

fn in_range(tail: u32, head: u32, n: u32) -> bool {
    before_or_eq(tail, n) && n != head && before_or_eq(n, head.wrapping_sub(1))
}

/// Wrapping-aware `a <= b`, valid for the bounded deltas (`< MAX_SEGMENTS`)
/// this ring ever compares; segment numbers themselves may wrap at 2^32 but
/// the spec treats that as out of scope.
fn before_or_eq(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < MAX_SEGMENTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_then_write_then_read() {
        let dir = tempdir().unwrap();
        let ring = SegmentRing::new(dir.path().to_path_buf(), "q".to_string(), 256);
        ring.allocate(0, 0).unwrap();
        let store = ring.get_for_writing(0).unwrap();
        store.write(&[1, 2, 3]).unwrap();
        ring.release_for_writing(0);
        store.sync().unwrap();
        ring.close(0).unwrap();

        let reopened = ring.get_for_reading(0).unwrap().unwrap();
        let (off, len) = reopened.pop_cursor().unwrap().unwrap();
        assert_eq!(reopened.payload_at(off, len).unwrap(), &[1, 2, 3]);
        ring.release_for_reading(0);
    }

    #[test]
    fn allocate_tolerates_lost_race() {
        let dir = tempdir().unwrap();
        let ring = SegmentRing::new(dir.path().to_path_buf(), "q".to_string(), 256);
        ring.allocate(0, 0).unwrap();
        ring.allocate(0, 0).unwrap(); // no-op, already allocated
        assert_eq!(ring.head(), 1);
    }

    #[test]
    fn close_rejects_outstanding_writer() {
        let dir = tempdir().unwrap();
        let ring = SegmentRing::new(dir.path().to_path_buf(), "q".to_string(), 256);
        ring.allocate(0, 0).unwrap();
        let _store = ring.get_for_writing(0).unwrap();
        assert!(ring.close(0).is_err());
        ring.release_for_writing(0);
    }

    #[test]
    fn free_up_to_destroys_contiguous_read_segments() {
        let dir = tempdir().unwrap();
        let ring = SegmentRing::new(dir.path().to_path_buf(), "q".to_string(), 256);
        for n in 0..3u32 {
            ring.allocate(n, 0).unwrap();
            let store = ring.get_for_writing(n).unwrap();
            store.write(&[n as u8]).unwrap();
            ring.release_for_writing(n);
            store.sync().unwrap();
            ring.close(n).unwrap();
            let reopened = ring.get_for_reading(n).unwrap().unwrap();
            ring.release_for_reading(n);
            drop(reopened);
        }
        let new_tail = ring.free_up_to(2);
        assert_eq!(new_tail, 3);
        for n in 0..3u32 {
            assert!(!dir.path().join(segment_file_name("q", n)).exists());
        }
    }
}
