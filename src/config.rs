//! Plain configuration structs with `Default` impls, the shape the
//! teacher's `core/reader.rs::ReaderConfig` uses rather than a builder or a
//! config-file parser — this queue has few enough knobs that a struct
//! literal is all the ergonomics it needs.

/// Truncate/remove an existing store file of the same name at creation
/// (spec §6). Independent of [`crate::counter::PAV_DELETE_IF_EXISTS`] —
/// the two file families are creatable-with-truncation independently.
pub use crate::store::DELETE_IF_EXISTS;

/// Same semantics as [`DELETE_IF_EXISTS`] but for the persistent counter
/// files backing `sync_head`/`sync_tail`.
pub use crate::counter::PAV_DELETE_IF_EXISTS;

/// Tunables for [`crate::queue::Queue::create`] / [`crate::queue::Queue::open`].
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Fixed size of each segment's store file, in bytes. Must be at least
    /// `crate::store::MIN_STORE_SIZE`. No universal default makes sense
    /// here — this is workload-dependent and the caller must choose it.
    pub segment_size: usize,
    /// OR of [`DELETE_IF_EXISTS`] / [`PAV_DELETE_IF_EXISTS`], applied to
    /// every store and counter file this queue creates.
    pub create_flags: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            segment_size: 64 * 1024 * 1024,
            create_flags: 0,
        }
    }
}
