//! Segment lifecycle (spec §3 "Segment", §4.3's state table).
//!
//! A segment is one store plus the bookkeeping the ring needs to schedule
//! it: its number, its reference count, and which of the four lifecycle
//! states it currently occupies. The ring (`ring.rs`) owns the array of
//! these and the lock that protects transitions; this module only names the
//! states and the on-disk naming scheme, mirroring how the teacher's
//! `segment_store.rs` keeps `segment_filename`/`parse_segment_filename`
//! separate from the writer that calls them.

use std::sync::Arc;

use crate::store::Store;

/// | State   | Store present | Writers | Readers | Transition out                      |
/// |---------|---------------|---------|---------|--------------------------------------|
/// | Free    | no            | —       | —       | → Writing on allocate                |
/// | Writing | yes           | yes     | no      | → Closed when sealed and closed      |
/// | Closed  | no (on disk)  | no      | no      | → Reading on first reader, → Free    |
/// | Reading | yes           | no      | yes     | → Free when refcount hits 0 on free  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Free,
    Writing,
    Closed,
    Reading,
}

/// One ring slot. `store` is `None` in the `Free` and `Closed` states:
/// closing releases the mmap and descriptor but leaves the file on disk, to
/// be lazily reopened the first time a reader touches this segment again.
pub(crate) struct Segment {
    pub segment_number: u32,
    pub state: SegmentState,
    pub store: Option<Arc<Store>>,
}

impl Segment {
    pub fn free(segment_number: u32) -> Self {
        Segment {
            segment_number,
            state: SegmentState::Free,
            store: None,
        }
    }
}

/// Segment store files are named `{queue}{N}` with a fixed-width zero-padded
/// decimal suffix (spec §6), wide enough for the 32-bit segment number space.
pub fn segment_file_name(name_prefix: &str, segment_number: u32) -> String {
    format!("{name_prefix}{segment_number:010}")
}
