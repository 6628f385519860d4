//! Storage backend trait definition.

use crate::error::StorageResult;

/// A byte store underneath a [`crate::Journal`].
///
/// Backends never interpret what they store; the journal owns the framing.
///
/// # Invariants
///
/// - after `sync` returns, all appended data survives process termination
/// - `replace` is atomic: a crash leaves either the old or the new bytes
pub trait StorageBackend: Send + Sync {
    /// Reads every stored byte.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Makes appended data durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the storage down to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` exceeds the current size or the truncation
    /// fails.
    fn truncate(&mut self, len: u64) -> StorageResult<()>;

    /// Swaps the whole content for `data` and makes it durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be written.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        (**self).read_all()
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        (**self).append(data)
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        (**self).truncate(len)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        (**self).replace(data)
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }
}
