//! Crash recovery testing for Prevail.
//!
//! A crash is simulated by copying the files of a running store into a new
//! directory ([`CrashImage`]): the copy holds exactly what a killed process
//! would leave on disk, since every commit is appended before it returns.
//! The remaining helpers damage journal segments the way an interrupted
//! write or a bad disk would.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prevail_testkit::crash::CrashImage;
//!
//! let image = CrashImage::capture(&store_path)?;
//! tear_last_segment(image.path(), 5)?;
//! let engine = Engine::<KvModel>::load(image.path(), kv_registry(), Config::default())?;
//! ```

use prevail_core::{CommandRegistry, Config, CoreResult, Engine, Model};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LOCK_FILE: &str = "LOCK";

/// A copy of a store's files taken while its engine was still running.
pub struct CrashImage {
    dir: TempDir,
}

impl CrashImage {
    /// Copies every file of the store at `path`, except its lock.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let target = dir.path().join("store");
        fs::create_dir(&target)?;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() || entry.file_name() == LOCK_FILE {
                continue;
            }
            fs::copy(entry.path(), target.join(entry.file_name()))?;
        }
        Ok(Self { dir })
    }

    /// Path of the copied store.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    /// Loads an engine from the image, as a restarted process would.
    pub fn load<M: Model>(
        &self,
        registry: CommandRegistry<M>,
        config: Config,
    ) -> CoreResult<Engine<M>> {
        Engine::load(&self.path(), registry, config)
    }
}

/// Journal segment files of the store at `path`, in sequence order.
pub fn journal_segments(path: &Path) -> io::Result<Vec<PathBuf>> {
    files_with_extension(path, "journal")
}

/// Snapshot files of the store at `path`, in revision order.
pub fn snapshot_files(path: &Path) -> io::Result<Vec<PathBuf>> {
    files_with_extension(path, "snapshot")
}

fn files_with_extension(path: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let file = entry?.path();
        if file.extension().is_some_and(|ext| ext == extension) {
            files.push(file);
        }
    }
    // Zero-padded names sort numerically.
    files.sort();
    Ok(files)
}

fn last_segment(path: &Path) -> io::Result<PathBuf> {
    journal_segments(path)?
        .pop()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "store has no journal segment"))
}

/// Cuts `bytes` off the end of the last segment, as a write interrupted
/// mid-record would. Returns the new length.
pub fn tear_last_segment(path: &Path, bytes: u64) -> io::Result<u64> {
    let segment = last_segment(path)?;
    let file = OpenOptions::new().write(true).open(&segment)?;
    let len = file.metadata()?.len().saturating_sub(bytes);
    file.set_len(len)?;
    file.sync_all()?;
    Ok(len)
}

/// Appends raw bytes to the last segment.
pub fn append_to_last_segment(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let segment = last_segment(path)?;
    let mut file = OpenOptions::new().append(true).open(&segment)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Inverts one byte of a file.
pub fn flip_byte(file: &Path, offset: usize) -> io::Result<()> {
    let mut data = fs::read(file)?;
    let byte = data.get_mut(offset).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "offset beyond end of file")
    })?;
    *byte ^= 0xFF;
    fs::write(file, data)
}
