//! The queue coordinator (spec §4.4): stitches many segments into a
//! durable FIFO by walking `write_segment` / `sync_head` / `read_segment` /
//! `next_close_segment` / `sync_tail` forward in lockstep.
//!
//! Grounded on `examples/original_source/persistent_queue/storage_manager.c`,
//! the direct ancestor of this coordinator — its recovery sequence (read
//! durable head/tail, open existing segments closed-not-reopened, allocate
//! a fresh write segment) is carried over unchanged into [`Queue::open`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::counter::PersistentCounter;
use crate::error::{fatal, Result};
use crate::ring::SegmentRing;
use crate::store::Store;

/// A block handed back by [`Queue::pop_cursor`]. Carries its owning
/// segment number so [`Queue::free_cursor`] can find the right segment to
/// release (spec §4.4.3; mirrors the C `store_cursor_t::store_id` field in
/// `examples/original_source/include/store.h`).
pub struct PoppedCursor {
    segment_number: u32,
    store: Arc<Store>,
    offset: u32,
    len: u32,
}

impl PoppedCursor {
    pub fn payload(&self) -> Result<&[u8]> {
        self.store.payload_at(self.offset, self.len)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_number(&self) -> u32 {
        self.segment_number
    }
}

pub struct Queue {
    base_dir: PathBuf,
    name: String,
    create_flags: u32,
    ring: SegmentRing,
    sync_head: PersistentCounter,
    sync_tail: PersistentCounter,
    write_segment: AtomicU32,
    read_segment: AtomicU32,
    next_close_segment: AtomicU32,
}

impl Queue {
    /// A brand-new queue with no segments allocated yet; the first `write`
    /// bootstraps segment 0.
    pub fn create(base_dir: &Path, name: &str, config: QueueConfig) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let sync_head = PersistentCounter::create(
            base_dir,
            &format!("{name}.sync_head"),
            0,
            config.create_flags,
        )?;
        let sync_tail = PersistentCounter::create(
            base_dir,
            &format!("{name}.sync_tail"),
            0,
            config.create_flags,
        )?;
        let ring = SegmentRing::new(base_dir.to_path_buf(), name.to_string(), config.segment_size);
        Ok(Queue {
            base_dir: base_dir.to_path_buf(),
            name: name.to_string(),
            create_flags: config.create_flags,
            ring,
            sync_head,
            sync_tail,
            write_segment: AtomicU32::new(0),
            read_segment: AtomicU32::new(0),
            next_close_segment: AtomicU32::new(0),
        })
    }

    /// Recovery-on-open (spec §4.4.5): the persisted `sync_head`/`sync_tail`
    /// are the durable truth; segments in `[sync_tail, sync_head)` enter as
    /// `Closed`, and a fresh writable segment is allocated at `sync_head`.
    pub fn open(base_dir: &Path, name: &str, config: QueueConfig) -> Result<Self> {
        let sync_head = PersistentCounter::open(base_dir, &format!("{name}.sync_head"))?;
        let sync_tail = PersistentCounter::open(base_dir, &format!("{name}.sync_tail"))?;
        let sh = sync_head.get();
        let st = sync_tail.get();
        let ring = SegmentRing::recover(
            base_dir.to_path_buf(),
            name.to_string(),
            config.segment_size,
            st,
            sh,
        );
        if let Err(err) = ring.allocate(sh, config.create_flags) {
            fatal("failed to allocate writable segment during recovery", &err);
        }
        Ok(Queue {
            base_dir: base_dir.to_path_buf(),
            name: name.to_string(),
            create_flags: config.create_flags,
            ring,
            sync_head,
            sync_tail,
            write_segment: AtomicU32::new(sh),
            read_segment: AtomicU32::new(st),
            next_close_segment: AtomicU32::new(sh),
        })
    }

    /// Appends `data` as one block, transparently rolling to a new segment
    /// when the current one reports full or sealing (spec §4.4.1).
    pub fn write(&self, data: &[u8]) -> Result<()> {
        loop {
            let w = self.write_segment.load(Ordering::Acquire);
            if self.ring.is_empty() {
                if let Err(err) = self.ring.allocate(w, self.create_flags) {
                    fatal("failed to bootstrap first segment", &err);
                }
            }
            let seg = match self.ring.get_for_writing(w) {
                Some(seg) => seg,
                None => continue, // raced with a sync rolling this segment; retry
            };
            let off = seg.write(data)?;
            if off > 0 {
                self.ring.release_for_writing(w);
                return Ok(());
            }
            self.ring.release_for_writing(w);
            self.sync_internal(false)?;
            if let Err(err) = self.ring.allocate(w + 1, self.create_flags) {
                fatal("failed to allocate next write segment", &err);
            }
            let _ = self.write_segment.compare_exchange(
                w,
                w + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Forces every segment up to and including the current write segment
    /// through sync, then closes whatever that makes eligible (spec §4.4.2).
    pub fn sync(&self) -> Result<()> {
        self.sync_internal(true)
    }

    fn sync_internal(&self, sync_current: bool) -> Result<()> {
        let w = self.write_segment.load(Ordering::Acquire);
        loop {
            let current_sh = self.sync_head.get();
            let should_sync = current_sh < w || (current_sh == w && sync_current);
            if !should_sync {
                break;
            }
            let seg = match self.ring.get_for_writing(current_sh) {
                Some(seg) => seg,
                None => break,
            };
            if current_sh == w && seg.is_empty() {
                self.ring.release_for_writing(current_sh);
                break;
            }
            loop {
                match seg.sync() {
                    Ok(()) => break,
                    Err(err) => {
                        self.ring.release_for_writing(current_sh);
                        return Err(err);
                    }
                }
            }
            let outcome = self.sync_head.compare_and_swap(current_sh, current_sh + 1);
            self.ring.release_for_writing(current_sh);
            if !outcome.ok {
                continue; // another thread's sync() won this segment; re-read and continue
            }
            if current_sh == w {
                if let Err(err) = self.ring.allocate(w + 1, self.create_flags) {
                    fatal("failed to allocate next write segment during sync", &err);
                }
                let _ = self.write_segment.compare_exchange(
                    w,
                    w + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }

        loop {
            let ncs = self.next_close_segment.load(Ordering::Acquire);
            let sh = self.sync_head.get();
            if ncs >= sh {
                break;
            }
            match self.ring.close(ncs) {
                Ok(()) => {
                    self.next_close_segment.store(ncs + 1, Ordering::Release);
                }
                Err(_) => break, // usually: segment still has outstanding readers
            }
        }
        Ok(())
    }

    /// Pops the next available block, or `None` if nothing is currently
    /// synced-and-closed to read (spec §4.4.3). Callers retry after a
    /// `sync()` elsewhere has made progress.
    pub fn pop_cursor(&self) -> Result<Option<PoppedCursor>> {
        loop {
            let r = self.read_segment.load(Ordering::Acquire);
            let n = self.next_close_segment.load(Ordering::Acquire);
            if r == n {
                return Ok(None);
            }
            if let Some(popped) = self.try_pop_from_segment(r)? {
                return Ok(Some(popped));
            }
            let _ =
                self.read_segment
                    .compare_exchange(r, r + 1, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn try_pop_from_segment(&self, n: u32) -> Result<Option<PoppedCursor>> {
        let store = match self.ring.get_for_reading(n)? {
            Some(store) => store,
            None => return Ok(None),
        };
        match store.pop_cursor()? {
            Some((offset, len)) => Ok(Some(PoppedCursor {
                segment_number: n,
                store,
                offset,
                len,
            })),
            None => {
                self.ring.release_for_reading(n);
                Ok(None)
            }
        }
    }

    /// Releases a cursor returned by `pop_cursor`, and opportunistically
    /// advances `sync_tail` (freeing now-unreachable segments) if the
    /// consumer side has moved past it (spec §4.4.4). Only one racing
    /// caller actually performs the free; the rest no-op.
    pub fn free_cursor(&self, cursor: PoppedCursor) {
        let segment_number = cursor.segment_number;
        drop(cursor);
        self.ring.release_for_reading(segment_number);

        let read_segment = self.read_segment.load(Ordering::Acquire);
        let old_sync_tail = self.sync_tail.get();
        if read_segment > old_sync_tail {
            let outcome = self
                .sync_tail
                .compare_and_swap(old_sync_tail, old_sync_tail + 1);
            if outcome.ok {
                self.ring.free_up_to(old_sync_tail);
            }
        }
    }

    /// Flushes everything through the current write segment. The queue's
    /// resources (mmaps, descriptors) are released when this handle is
    /// dropped; calls after `close` are undefined (spec §5 "cancellation").
    pub fn close(&self) -> Result<()> {
        self.sync_internal(true)
    }

    /// Consumes the queue and removes every file `{name}*` in `base_dir`
    /// (spec §8: "Destroying a queue removes all files matching
    /// `{queue}*`"). Drops `self` first so mmaps are unmapped before their
    /// backing files are unlinked.
    pub fn destroy(self) -> Result<()> {
        let base_dir = self.base_dir.clone();
        let prefix = self.name.clone();
        drop(self);
        for entry in std::fs::read_dir(&base_dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix))
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(segment_size: usize) -> QueueConfig {
        QueueConfig {
            segment_size,
            create_flags: crate::config::DELETE_IF_EXISTS | crate::config::PAV_DELETE_IF_EXISTS,
        }
    }

    #[test]
    fn single_threaded_round_trip() {
        let dir = tempdir().unwrap();
        let queue = Queue::create(dir.path(), "q", config(1 << 20)).unwrap();
        queue.write(&[0x41; 250]).unwrap();
        queue.sync().unwrap();
        let popped = queue.pop_cursor().unwrap().unwrap();
        assert_eq!(popped.payload().unwrap(), &[0x41; 250][..]);
        queue.free_cursor(popped);
        assert!(queue.pop_cursor().unwrap().is_none());
        queue.destroy().unwrap();
    }

    #[test]
    fn multi_segment_write_sync_pop() {
        let dir = tempdir().unwrap();
        let queue = Queue::create(dir.path(), "q", config(100)).unwrap();
        let payload = b"abcdefghijklmnopqrstuvwxyz";
        for _ in 0..32 {
            queue.write(payload).unwrap();
        }
        queue.sync().unwrap();
        for _ in 0..32 {
            let popped = queue.pop_cursor().unwrap().unwrap();
            assert_eq!(popped.payload().unwrap(), &payload[..]);
            queue.free_cursor(popped);
        }
        assert!(queue.pop_cursor().unwrap().is_none());
    }

    #[test]
    fn persistence_across_close_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let queue = Queue::create(dir.path(), "q", config(1 << 16)).unwrap();
            for i in 0..16u8 {
                queue.write(&[i; 8]).unwrap();
            }
            queue.sync().unwrap();
            queue.close().unwrap();
        }
        let queue = Queue::open(dir.path(), "q", config(1 << 16)).unwrap();
        for i in 16..32u8 {
            queue.write(&[i; 8]).unwrap();
        }
        queue.sync().unwrap();
        let mut count = 0;
        while let Some(popped) = queue.pop_cursor().unwrap() {
            count += 1;
            queue.free_cursor(popped);
        }
        assert_eq!(count, 32);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let dir = tempdir().unwrap();
        // A 300-byte block frames to 8 (header) + 4 (len) + 300 = 312 bytes;
        // the segment must be at least that large to hold even one block.
        let queue = Arc::new(Queue::create(dir.path(), "q", config(1024)).unwrap());
        let block = [b'B'; 300];

        let mut producers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for _ in 0..128 {
                    queue.write(&block).unwrap();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        queue.sync().unwrap();

        let total_read = Arc::new(AtomicUsize::new(0));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let total_read = Arc::clone(&total_read);
            consumers.push(thread::spawn(move || {
                loop {
                    match queue.pop_cursor().unwrap() {
                        Some(popped) => {
                            assert_eq!(popped.payload().unwrap(), &[b'B'; 300][..]);
                            queue.free_cursor(popped);
                            total_read.fetch_add(1, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            }));
        }
        for c in consumers {
            c.join().unwrap();
        }
        assert_eq!(total_read.load(Ordering::SeqCst), 512);
    }

    #[test]
    fn destroy_removes_all_queue_files() {
        let dir = tempdir().unwrap();
        let queue = Queue::create(dir.path(), "q", config(4096)).unwrap();
        queue.write(&[1; 8]).unwrap();
        queue.sync().unwrap();
        queue.destroy().unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.is_empty());
    }
}
