//! # Clinisync Storage
//!
//! Byte storage for the Clinisync sync queue.
//!
//! Backends are **opaque byte stores**: they read, append, sync, truncate
//! and atomically replace their content, and know nothing about sync
//! records. On top of them the
//! [`Journal`] frames each appended payload with a length and a CRC32 so a
//! torn write at the end of the file is detected and discarded on replay.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral nodes
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use clinisync_storage::{InMemoryBackend, Journal};
//!
//! let (mut journal, replay) = Journal::open(InMemoryBackend::new()).unwrap();
//! assert!(replay.frames.is_empty());
//! journal.append(b"record").unwrap();
//! assert_eq!(journal.frame_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{compute_crc32, Journal, Replay, FRAME_MAGIC};
pub use memory::InMemoryBackend;
