//! Durable 32-bit counter used for the queue's `sync_head`/`sync_tail`
//! cursors (spec §4.1). Crash-safe via a rename-through-hardlink persist
//! protocol: a reader can always tell, after any crash, whether the last
//! write committed.
//!
//! Grounded on the same load/store-a-little-endian-binary-file shape as the
//! teacher's `segment_store.rs::{load_index, store_index}`, generalized to
//! the crash-safety the teacher's version didn't need (it overwrote via
//! plain truncate+write, which is fine for non-durable debug indices but not
//! for the cursors this queue's recovery correctness depends on).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{fatal, Error, Result};

pub const PAV_DELETE_IF_EXISTS: u32 = 0x0002;

pub struct PersistentCounter {
    path: PathBuf,
    tmp_path: PathBuf,
    value: Mutex<u32>,
}

/// Outcome of a `compare_and_swap` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    pub ok: bool,
    pub lost_race: bool,
}

impl PersistentCounter {
    /// Create a new counter file initialized to `initial`. If `flags`
    /// carries `PAV_DELETE_IF_EXISTS`, an existing primary/tmp pair is
    /// removed first; otherwise an existing primary is an error.
    pub fn create(base_dir: &Path, name: &str, initial: u32, flags: u32) -> Result<Self> {
        let path = base_dir.join(name);
        let tmp_path = tmp_path_for(&path);
        if flags & PAV_DELETE_IF_EXISTS != 0 {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(&tmp_path);
        } else if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "counter file already exists",
            )));
        }
        let counter = Self {
            path,
            tmp_path,
            value: Mutex::new(initial),
        };
        persist(&counter.path, &counter.tmp_path, initial)?;
        Ok(counter)
    }

    /// Open an existing counter, completing any in-flight persist left by a
    /// crash between steps 3 and 5 of the persist protocol (spec §4.1).
    pub fn open(base_dir: &Path, name: &str) -> Result<Self> {
        let path = base_dir.join(name);
        let tmp_path = tmp_path_for(&path);

        if !path.exists() {
            if tmp_path.exists() {
                // Crashed between unlinking the primary and linking tmp
                // into place: finish the link, then drop tmp.
                fs::hard_link(&tmp_path, &path)?;
                fs::remove_file(&tmp_path)?;
            } else {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "counter file does not exist",
                )));
            }
        } else if tmp_path.exists() {
            // Crashed between linking and unlinking tmp, or tmp is simply
            // stale from a prior run: the primary always wins.
            let _ = fs::remove_file(&tmp_path);
        }

        let value = read_u32(&path)?;
        Ok(Self {
            path,
            tmp_path,
            value: Mutex::new(value),
        })
    }

    /// In-memory cached value. O(1), no I/O.
    pub fn get(&self) -> u32 {
        *self.value.lock().unwrap()
    }

    /// Atomically transition `old -> new` under the counter's exclusive
    /// lock, persisting the new value before releasing it.
    ///
    /// Any I/O failure during persist is fatal: the in-memory value is
    /// rolled back to `old` and the process aborts, since a partially
    /// persisted counter can no longer be trusted (spec §4.1 "Failure
    /// semantics").
    pub fn compare_and_swap(&self, old: u32, new: u32) -> CasOutcome {
        let mut guard = self.value.lock().unwrap();
        if *guard != old {
            return CasOutcome {
                ok: false,
                lost_race: true,
            };
        }
        match persist(&self.path, &self.tmp_path, new) {
            Ok(()) => {
                *guard = new;
                CasOutcome {
                    ok: true,
                    lost_race: false,
                }
            }
            Err(err) => {
                // guard still holds `old`; leave it untouched and abort.
                drop(guard);
                fatal("persistent counter write failed", &err);
            }
        }
    }

    pub fn destroy(self) -> Result<()> {
        let _ = fs::remove_file(&self.tmp_path);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn read_u32(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Steps 1-5 of spec §4.1's persist protocol: write to a fresh tmp file,
/// fsync it and its directory, unlink the primary, hard-link tmp into the
/// primary's name, unlink tmp.
fn persist(path: &Path, tmp_path: &Path, value: u32) -> Result<()> {
    let _ = fs::remove_file(tmp_path);
    let mut tmp = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(tmp_path)?;
    tmp.write_all(&value.to_le_bytes())?;
    tmp.sync_all()?;
    drop(tmp);
    fsync_parent_dir(tmp_path)?;

    // Primary may not exist yet on first persist after create().
    let _ = fs::remove_file(path);
    fs::hard_link(tmp_path, path)?;
    fs::remove_file(tmp_path)?;
    fsync_parent_dir(path)?;
    Ok(())
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_cas_sequence() {
        let dir = tempdir().unwrap();
        let counter = PersistentCounter::create(dir.path(), "sync_head", 0, 0).unwrap();
        for i in 0..100u32 {
            let outcome = counter.compare_and_swap(i, i + 1);
            assert!(outcome.ok);
            assert!(!outcome.lost_race);
        }
        assert_eq!(counter.get(), 100);
    }

    #[test]
    fn reopen_after_close_preserves_value() {
        let dir = tempdir().unwrap();
        {
            let counter = PersistentCounter::create(dir.path(), "sync_head", 0, 0).unwrap();
            for i in 0..100u32 {
                counter.compare_and_swap(i, i + 1);
            }
        }
        let counter = PersistentCounter::open(dir.path(), "sync_head").unwrap();
        assert_eq!(counter.get(), 100);
        let outcome = counter.compare_and_swap(0, 1);
        assert!(!outcome.ok);
        assert!(outcome.lost_race);
        assert_eq!(counter.get(), 100);
    }

    #[test]
    fn open_recovers_from_crash_between_unlink_and_link() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync_tail");
        let tmp_path = tmp_path_for(&path);
        // Simulate a crash after unlinking the primary but before the
        // hardlink landed: only tmp exists.
        let mut tmp = File::create(&tmp_path).unwrap();
        tmp.write_all(&7u32.to_le_bytes()).unwrap();
        drop(tmp);

        let counter = PersistentCounter::open(dir.path(), "sync_tail").unwrap();
        assert_eq!(counter.get(), 7);
        assert!(!tmp_path.exists());
        assert!(path.exists());
    }

    #[test]
    fn open_cleans_up_stale_tmp_when_primary_exists() {
        let dir = tempdir().unwrap();
        let counter = PersistentCounter::create(dir.path(), "sync_head", 5, 0).unwrap();
        drop(counter);
        let tmp_path = tmp_path_for(&dir.path().join("sync_head"));
        File::create(&tmp_path).unwrap();

        let counter = PersistentCounter::open(dir.path(), "sync_head").unwrap();
        assert_eq!(counter.get(), 5);
        assert!(!tmp_path.exists());
    }

    #[test]
    fn delete_if_exists_truncates_prior_counter() {
        let dir = tempdir().unwrap();
        PersistentCounter::create(dir.path(), "sync_head", 42, 0).unwrap();
        let counter =
            PersistentCounter::create(dir.path(), "sync_head", 0, PAV_DELETE_IF_EXISTS).unwrap();
        assert_eq!(counter.get(), 0);
    }
}
