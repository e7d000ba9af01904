//! The store contract compression must uphold (spec §6 "Compression
//! wrapper (external collaborator) contract").
//!
//! The queue coordinator and segment ring are written directly against
//! [`crate::store::Store`] — compression is genuinely external, not wired
//! into either. This module exists so an LZ4-backed store can be built
//! that still behaves like a store from the outside: block-framed,
//! `write`/`sync`/`pop_cursor` shaped, permitted to encode differently on
//! disk. The vtable-style "methods on a handle" the original C expresses
//! through function pointers becomes, in Rust, one trait with two
//! implementers (spec §9 "Vtable-style methods").

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::Store;

/// Anything satisfying this trait can stand in for a plain store wherever
/// only the logical block contract matters (not the physical layout).
pub trait StoreBackend: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<u32>;
    fn sync(&self) -> Result<()>;
    fn pop_cursor(&self) -> Result<Option<(u32, u32)>>;
    /// Returns an owned copy of the payload at `(offset, len)` — unlike
    /// `Store::payload_at`'s zero-copy `&[u8]`, a compressing backend has
    /// no stable slice to hand back once it's decoded one.
    fn payload_at(&self, offset: u32, len: u32) -> Result<Vec<u8>>;
    fn capacity(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn is_synced(&self) -> bool;
}

impl StoreBackend for Store {
    fn write(&self, data: &[u8]) -> Result<u32> {
        Store::write(self, data)
    }

    fn sync(&self) -> Result<()> {
        Store::sync(self)
    }

    fn pop_cursor(&self) -> Result<Option<(u32, u32)>> {
        Store::pop_cursor(self)
    }

    fn payload_at(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        Store::payload_at(self, offset, len).map(|slice| slice.to_vec())
    }

    fn capacity(&self) -> usize {
        Store::capacity(self)
    }

    fn is_empty(&self) -> bool {
        Store::is_empty(self)
    }

    fn is_synced(&self) -> bool {
        Store::is_synced(self)
    }
}

impl<T: StoreBackend + ?Sized> StoreBackend for Arc<T> {
    fn write(&self, data: &[u8]) -> Result<u32> {
        (**self).write(data)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn pop_cursor(&self) -> Result<Option<(u32, u32)>> {
        (**self).pop_cursor()
    }

    fn payload_at(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        (**self).payload_at(offset, len)
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn is_synced(&self) -> bool {
        (**self).is_synced()
    }
}

/// A transparent LZ4-compressing decorator over any [`StoreBackend`].
///
/// Each write is compressed independently before being handed to the
/// inner store, which frames it exactly like any other block — the inner
/// store has no idea its payloads are compressed. `pop_cursor`'s returned
/// length is therefore the *compressed* frame length; callers must treat
/// it as opaque and always go through `payload_at` to recover the
/// original bytes.
#[cfg(feature = "lz4")]
pub struct Lz4Store<S: StoreBackend> {
    inner: S,
}

#[cfg(feature = "lz4")]
impl<S: StoreBackend> Lz4Store<S> {
    pub fn new(inner: S) -> Self {
        Lz4Store { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[cfg(feature = "lz4")]
impl<S: StoreBackend> StoreBackend for Lz4Store<S> {
    fn write(&self, data: &[u8]) -> Result<u32> {
        let compressed = lz4_flex::compress_prepend_size(data);
        self.inner.write(&compressed)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn pop_cursor(&self) -> Result<Option<(u32, u32)>> {
        self.inner.pop_cursor()
    }

    fn payload_at(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let compressed = self.inner.payload_at(offset, len)?;
        lz4_flex::decompress_size_prepended(&compressed).map_err(|_| Error::DecompressionFault)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn is_synced(&self) -> bool {
        self.inner.is_synced()
    }
}

#[cfg(all(test, feature = "lz4"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_compression() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), "store0", 1 << 16, 0).unwrap();
        let wrapped = Lz4Store::new(Arc::clone(&store));
        let payload = vec![0x7a; 4096];
        let off = wrapped.write(&payload).unwrap();
        assert!(off > 0);
        wrapped.sync().unwrap();
        let (block_off, block_len) = wrapped.pop_cursor().unwrap().unwrap();
        let recovered = wrapped.payload_at(block_off, block_len).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn corrupt_compressed_bytes_surface_decompression_fault() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), "store0", 1 << 16, 0).unwrap();
        store.write(b"not actually lz4 framed data").unwrap();
        store.sync().unwrap();
        let wrapped = Lz4Store::new(Arc::clone(&store));
        let (off, len) = wrapped.pop_cursor().unwrap().unwrap();
        assert!(matches!(
            wrapped.payload_at(off, len),
            Err(Error::DecompressionFault)
        ));
    }
}
