//! Journal writer.

use crate::error::{CoreError, CoreResult};
use crate::journal::reader::scan_segment;
use crate::journal::record::JournalEntry;
use crate::journal::rollover::RolloverStrategy;
use crate::journal::segment::SegmentId;
use crate::types::{EntryId, Timestamp};
use prevail_storage::{Directory, StorageBackend};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct OpenSegment {
    id: SegmentId,
    backend: Box<dyn StorageBackend>,
    bytes: u64,
    entries: u64,
}

/// Appends entries to the current segment and rolls over to new ones.
///
/// Segments are opened lazily: after a rollover the next segment file is
/// created by the following append, so its name carries the id of the entry
/// it starts with.
pub struct JournalWriter {
    directory: Arc<dyn Directory>,
    current: Option<OpenSegment>,
    last_sequence: u64,
    next_entry_id: EntryId,
    rollover: Box<dyn RolloverStrategy>,
    sync_on_append: bool,
}

impl JournalWriter {
    /// Opens a writer that will append `next_entry_id` next.
    ///
    /// The last existing segment is reused if it ends cleanly with the entry
    /// before `next_entry_id` and is not already full. If it ends in a torn
    /// record the writer leaves it alone and starts a new segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal already holds entries at or past
    /// `next_entry_id`, or on I/O failure.
    pub fn open(
        directory: Arc<dyn Directory>,
        segments: &[SegmentId],
        next_entry_id: EntryId,
        mut rollover: Box<dyn RolloverStrategy>,
        sync_on_append: bool,
    ) -> CoreResult<Self> {
        let mut current = None;
        let mut last_sequence = 0;

        if let Some(&last) = segments.last() {
            last_sequence = last.sequence;
            let scan = scan_segment(directory.as_ref(), last)?;
            let journal_next = scan.last_entry_id.map_or(last.first_entry_id, EntryId::next);

            if journal_next > next_entry_id {
                return Err(CoreError::journal_corruption(format!(
                    "journal continues to {journal_next} but the model ends before {next_entry_id}"
                )));
            }

            if scan.is_torn() {
                warn!(
                    segment = %last,
                    valid_len = scan.valid_len,
                    size = scan.size,
                    "current segment has a torn tail, starting a new segment"
                );
            } else if journal_next < next_entry_id {
                warn!(
                    segment = %last,
                    %journal_next,
                    %next_entry_id,
                    "journal ends before the model revision, starting a new segment"
                );
            } else {
                if let Some(first) = scan.first_timestamp {
                    let age = Timestamp::now().as_millis().saturating_sub(first.as_millis());
                    rollover.resume(Duration::from_millis(age));
                }
                if scan.entries > 0 && rollover.should_rollover(scan.valid_len, scan.entries) {
                    debug!(segment = %last, "current segment already full");
                } else {
                    current = Some(OpenSegment {
                        id: last,
                        backend: directory.open_append(&last.file_name())?,
                        bytes: scan.valid_len,
                        entries: scan.entries,
                    });
                }
            }
        }

        if current.is_none() {
            rollover.reset();
        }
        Ok(Self {
            directory,
            current,
            last_sequence,
            next_entry_id,
            rollover,
            sync_on_append,
        })
    }

    /// Id the next appended entry must carry.
    #[must_use]
    pub fn next_entry_id(&self) -> EntryId {
        self.next_entry_id
    }

    /// The segment currently open for append, if any.
    #[must_use]
    pub fn current_segment(&self) -> Option<SegmentId> {
        self.current.as_ref().map(|open| open.id)
    }

    /// Appends one entry.
    ///
    /// Returns once the record has been handed to the OS, or made durable
    /// if `sync_on_append` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the entry id is not the
    /// next id, or an I/O error. After an I/O error the segment may end in a
    /// partial record; the writer must not be used again.
    pub fn append(&mut self, entry: &JournalEntry) -> CoreResult<()> {
        if entry.id != self.next_entry_id {
            return Err(CoreError::invalid_operation(format!(
                "out-of-order append: expected {}, got {}",
                self.next_entry_id, entry.id
            )));
        }
        let frame = entry.encode_frame()?;

        if self.current.is_none() {
            self.start_segment(entry.id)?;
        }
        let Some(open) = self.current.as_mut() else {
            return Err(CoreError::invalid_operation("no journal segment open"));
        };
        open.backend.append(&frame)?;
        if self.sync_on_append {
            open.backend.sync()?;
        } else {
            open.backend.flush()?;
        }
        open.bytes += frame.len() as u64;
        open.entries += 1;
        self.next_entry_id = entry.id.next();

        if self.rollover.should_rollover(open.bytes, open.entries) {
            self.finish_segment()?;
        }
        Ok(())
    }

    /// Makes everything appended so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> CoreResult<()> {
        if let Some(open) = self.current.as_mut() {
            open.backend.sync()?;
        }
        Ok(())
    }

    /// Syncs and closes the current segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn close(&mut self) -> CoreResult<()> {
        self.sync()?;
        self.current = None;
        Ok(())
    }

    fn start_segment(&mut self, first_entry_id: EntryId) -> CoreResult<()> {
        let id = SegmentId::new(self.last_sequence + 1, first_entry_id);
        let backend = self.directory.open_append(&id.file_name())?;
        self.directory.sync()?;
        self.last_sequence = id.sequence;
        self.rollover.reset();
        debug!(segment = %id, "opened journal segment");
        self.current = Some(OpenSegment {
            id,
            backend,
            bytes: 0,
            entries: 0,
        });
        Ok(())
    }

    fn finish_segment(&mut self) -> CoreResult<()> {
        if let Some(mut open) = self.current.take() {
            open.backend.sync()?;
            info!(
                segment = %open.id,
                entries = open.entries,
                bytes = open.bytes,
                "journal segment rolled over"
            );
        }
        Ok(())
    }
}

impl fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalWriter")
            .field("location", &self.directory.location())
            .field("current_segment", &self.current_segment())
            .field("next_entry_id", &self.next_entry_id)
            .finish_non_exhaustive()
    }
}
