//! # Prevail Storage
//!
//! Storage abstractions for the Prevail prevalence engine.
//!
//! Backends are **opaque byte stores**: they never interpret what they hold.
//! Journal framing, snapshot layout and manifest encoding all live in
//! `prevail_core`.
//!
//! ## Building Blocks
//!
//! - [`StorageBackend`] - a single append-only byte stream (one journal segment)
//! - [`Directory`] - a named set of backends plus atomically replaced blobs
//!   (snapshots, manifest)
//!
//! ## Available Implementations
//!
//! - [`InMemoryBackend`] / [`InMemoryDirectory`] - for tests and ephemeral engines
//! - [`FileBackend`] / [`FileDirectory`] - for persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use prevail_storage::{Directory, InMemoryDirectory, StorageBackend};
//!
//! let dir = InMemoryDirectory::new();
//! let mut segment = dir.open_append("00000001-0000000000000001.journal").unwrap();
//! let offset = segment.append(b"hello world").unwrap();
//! assert_eq!(segment.read_at(offset, 11).unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod directory;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use directory::{Directory, FileDirectory, InMemoryDirectory};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
