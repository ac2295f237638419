//! Persistent stores.
//!
//! A [`Store`] holds everything the engine persists: the manifest, journal
//! segments and snapshots. It works at the byte level and never sees model
//! or command types, so any implementation honoring the contract can back
//! an engine.
//!
//! [`SegmentedStore`] is the implementation shipped with Prevail. It lays the
//! store out as a flat [`Directory`], on disk or in memory.

use crate::error::{CoreError, CoreResult};
use crate::journal::{
    scan_segment, JournalReader, JournalWriter, RolloverStrategy, SegmentId, SegmentScan,
};
use crate::manifest::{StoreManifest, MANIFEST_NAME};
use crate::snapshot::SnapshotRecord;
use crate::types::{EntryId, Revision};
use prevail_storage::{Directory, FileDirectory, InMemoryDirectory, StorageError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable storage for one engine.
///
/// Contract:
///
/// - journal entries come back from [`Store::entries_from`] in id order,
///   gapless, exactly as appended
/// - a snapshot written by [`Store::write_snapshot`] is either fully visible
///   or not at all
/// - [`Store::latest_snapshot`] returns the snapshot with the highest revision
pub trait Store: Send + Sync + fmt::Debug {
    /// Human-readable location, for logs and errors.
    fn location(&self) -> String;

    /// Returns true if the store holds a snapshot or a segment.
    ///
    /// A manifest on its own is left behind by a create that did not reach
    /// its genesis snapshot, and does not count.
    fn exists(&self) -> CoreResult<bool>;

    /// Prepares an empty store and writes its manifest, replacing one left
    /// by an interrupted create.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreExists`] if the store is not empty.
    fn initialize(&self, format_version: (u16, u16)) -> CoreResult<StoreManifest>;

    /// Reads the manifest, if one was written.
    fn manifest(&self) -> CoreResult<Option<StoreManifest>>;

    /// Journal segments, sorted by sequence.
    fn segments(&self) -> CoreResult<Vec<SegmentId>>;

    /// Revisions of all snapshots, ascending.
    fn snapshots(&self) -> CoreResult<Vec<Revision>>;

    /// Writes a snapshot atomically.
    fn write_snapshot(&self, snapshot: &SnapshotRecord) -> CoreResult<()>;

    /// Reads the snapshot taken at `revision`.
    fn read_snapshot(&self, revision: Revision) -> CoreResult<SnapshotRecord>;

    /// Reads the snapshot with the highest revision.
    fn latest_snapshot(&self) -> CoreResult<Option<SnapshotRecord>> {
        match self.snapshots()?.last() {
            Some(&revision) => self.read_snapshot(revision).map(Some),
            None => Ok(None),
        }
    }

    /// Streams journal entries with id `>= from`.
    fn entries_from(&self, from: EntryId) -> CoreResult<JournalReader>;

    /// Opens the journal for appending, starting at `next_entry_id`.
    fn create_journal_writer(
        &self,
        next_entry_id: EntryId,
        rollover: Box<dyn RolloverStrategy>,
        sync_on_append: bool,
    ) -> CoreResult<JournalWriter>;

    /// Id of the last complete entry in the journal.
    fn last_entry_id(&self) -> CoreResult<Option<EntryId>>;
}

/// A store laid out as segment, snapshot and manifest files in a
/// [`Directory`].
#[derive(Debug, Clone)]
pub struct SegmentedStore {
    directory: Arc<dyn Directory>,
}

impl SegmentedStore {
    /// Wraps a directory.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Opens a store on disk, taking its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreLocked`] if another engine has it open, or
    /// an error if the directory is missing and `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        let directory = FileDirectory::open(path, create_if_missing).map_err(|e| match e {
            StorageError::Locked { path } => CoreError::StoreLocked { path },
            other => CoreError::Storage(other),
        })?;
        Ok(Self::new(Arc::new(directory)))
    }

    /// Opens a store on disk for inspection, without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist.
    pub fn open_read_only(path: &Path) -> CoreResult<Self> {
        Ok(Self::new(Arc::new(FileDirectory::open_read_only(path)?)))
    }

    /// Creates an empty in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryDirectory::new()))
    }

    /// The underlying directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Scans every segment, for verification and tooling.
    ///
    /// # Errors
    ///
    /// Returns the first corruption found.
    pub fn scan_segments(&self) -> CoreResult<Vec<SegmentScan>> {
        self.segments()?
            .into_iter()
            .map(|segment| scan_segment(self.directory.as_ref(), segment))
            .collect()
    }
}

impl Store for SegmentedStore {
    fn location(&self) -> String {
        self.directory.location()
    }

    fn exists(&self) -> CoreResult<bool> {
        Ok(self.directory.list()?.iter().any(|name| {
            SegmentId::parse(name).is_some() || SnapshotRecord::parse_file_name(name).is_some()
        }))
    }

    fn initialize(&self, format_version: (u16, u16)) -> CoreResult<StoreManifest> {
        if self.exists()? {
            return Err(CoreError::StoreExists {
                location: self.location(),
            });
        }
        let manifest = StoreManifest::new(format_version);
        self.directory
            .write_atomic(MANIFEST_NAME, &manifest.encode())?;
        info!(
            location = %self.location(),
            store_id = %manifest.store_id,
            "store initialized"
        );
        Ok(manifest)
    }

    fn manifest(&self) -> CoreResult<Option<StoreManifest>> {
        if !self.directory.exists(MANIFEST_NAME)? {
            return Ok(None);
        }
        StoreManifest::decode(&self.directory.read(MANIFEST_NAME)?).map(Some)
    }

    fn segments(&self) -> CoreResult<Vec<SegmentId>> {
        let mut segments: Vec<SegmentId> = self
            .directory
            .list()?
            .iter()
            .filter_map(|name| SegmentId::parse(name))
            .collect();
        segments.sort();

        for pair in segments.windows(2) {
            if pair[0].sequence == pair[1].sequence || pair[0].first_entry_id > pair[1].first_entry_id
            {
                return Err(CoreError::journal_corruption(format!(
                    "segments {} and {} are out of order",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(segments)
    }

    fn snapshots(&self) -> CoreResult<Vec<Revision>> {
        let mut revisions: Vec<Revision> = self
            .directory
            .list()?
            .iter()
            .filter_map(|name| SnapshotRecord::parse_file_name(name))
            .collect();
        revisions.sort();
        Ok(revisions)
    }

    fn write_snapshot(&self, snapshot: &SnapshotRecord) -> CoreResult<()> {
        let name = SnapshotRecord::file_name(snapshot.revision);
        self.directory.write_atomic(&name, &snapshot.encode())?;
        debug!(snapshot = %name, bytes = snapshot.model.len(), "snapshot written");
        Ok(())
    }

    fn read_snapshot(&self, revision: Revision) -> CoreResult<SnapshotRecord> {
        let name = SnapshotRecord::file_name(revision);
        let record = SnapshotRecord::decode(&self.directory.read(&name)?)?;
        if record.revision != revision {
            return Err(CoreError::snapshot_corruption(format!(
                "{name} holds revision {}",
                record.revision.as_u64()
            )));
        }
        Ok(record)
    }

    fn entries_from(&self, from: EntryId) -> CoreResult<JournalReader> {
        Ok(JournalReader::new(
            Arc::clone(&self.directory),
            &self.segments()?,
            from,
        ))
    }

    fn create_journal_writer(
        &self,
        next_entry_id: EntryId,
        rollover: Box<dyn RolloverStrategy>,
        sync_on_append: bool,
    ) -> CoreResult<JournalWriter> {
        JournalWriter::open(
            Arc::clone(&self.directory),
            &self.segments()?,
            next_entry_id,
            rollover,
            sync_on_append,
        )
    }

    fn last_entry_id(&self) -> CoreResult<Option<EntryId>> {
        for segment in self.segments()?.into_iter().rev() {
            if let Some(id) = scan_segment(self.directory.as_ref(), segment)?.last_entry_id {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}
