//! Named sets of storage backends.
//!
//! A store is laid out as a flat directory:
//!
//! ```text
//! <store>/
//! ├─ LOCK                                   # advisory lock, single engine per store
//! ├─ MANIFEST                               # store identity and format version
//! ├─ 00000001-0000000000000001.journal      # journal segments
//! ├─ 00000002-0000000000001001.journal
//! └─ 0000000000000000.snapshot              # snapshots, named by revision
//! ```
//!
//! [`Directory`] abstracts that layout so the same journal and snapshot code
//! runs against the file system or against memory.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const TEMP_SUFFIX: &str = ".tmp";

/// A flat, named collection of byte streams and blobs.
pub trait Directory: Send + Sync + std::fmt::Debug {
    /// Human-readable location, used in log and error messages.
    fn location(&self) -> String;

    /// Lists entry names in ascending order.
    ///
    /// Lock files and in-flight temporary files are not listed.
    fn list(&self) -> StorageResult<Vec<String>>;

    /// Returns whether an entry exists.
    fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Opens an entry for appending, creating it if missing.
    fn open_append(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens an existing entry for reading.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entry does not exist.
    fn open_read(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Reads a whole entry.
    fn read(&self, name: &str) -> StorageResult<Vec<u8>> {
        let backend = self.open_read(name)?;
        let size = usize::try_from(backend.size()?).unwrap_or(usize::MAX);
        backend.read_at(0, size)
    }

    /// Replaces an entry atomically: readers see either the old content or
    /// the complete new content, never a mix.
    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Makes entry creation and renames durable.
    fn sync(&self) -> StorageResult<()>;
}

fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name == LOCK_FILE
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
        || name.ends_with(TEMP_SUFFIX)
    {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A directory on the local file system.
///
/// Opening a writable `FileDirectory` takes an exclusive advisory lock on
/// `LOCK`; a second engine on the same path fails with
/// [`StorageError::Locked`]. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    lock_file: Option<File>,
}

impl FileDirectory {
    /// Opens (and optionally creates) a directory with exclusive access.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing and `create_if_missing`
    /// is false, if another process holds the lock, or on I/O failure.
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::Missing {
                    path: path.display().to_string(),
                });
            }
        }

        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.display().to_string(),
            });
        }

        debug!(path = %path.display(), "directory locked");

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Some(lock_file),
        })
    }

    /// Opens an existing directory for inspection without taking the lock.
    ///
    /// Every write operation on the returned handle fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        if !path.is_dir() {
            return Err(StorageError::Missing {
                path: path.display().to_string(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock_file: None,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.lock_file.is_none() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is opened read-only", self.path.display()),
            )));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl Directory for FileDirectory {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.path.join(name).is_file())
    }

    fn open_append(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        self.ensure_writable()?;
        let path = self.path.join(name);
        let created = !path.exists();
        let backend = FileBackend::open(&path)?;
        if created {
            self.sync_directory()?;
        }
        Ok(Box::new(backend))
    }

    fn open_read(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let path = self.path.join(name);
        if !path.is_file() {
            return Err(StorageError::not_found(name));
        }
        Ok(Box::new(FileBackend::open_read_only(&path)?))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        validate_name(name)?;
        self.ensure_writable()?;

        let target = self.path.join(name);
        let temp = self.path.join(format!("{name}{TEMP_SUFFIX}"));

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        self.sync_directory()
    }

    fn sync(&self) -> StorageResult<()> {
        self.sync_directory()
    }
}

/// An in-memory directory.
///
/// Clones share contents, so a test can drop an engine and load a new one
/// from a clone to simulate a process restart.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    entries: Arc<RwLock<BTreeMap<String, InMemoryBackend>>>,
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a shared handle to an entry, for crash and corruption tests.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<InMemoryBackend> {
        self.entries.read().get(name).cloned()
    }

    /// Removes an entry.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }
}

impl Directory for InMemoryDirectory {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.entries.read().contains_key(name))
    }

    fn open_append(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let backend = self
            .entries
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(backend))
    }

    fn open_read(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        self.entries
            .read()
            .get(name)
            .cloned()
            .map(|backend| Box::new(backend) as Box<dyn StorageBackend>)
            .ok_or_else(|| StorageError::not_found(name))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        validate_name(name)?;
        self.entries
            .write()
            .insert(name.to_string(), InMemoryBackend::with_data(data.to_vec()));
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
