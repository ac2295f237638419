//! Segment identity and file naming.

use crate::types::EntryId;
use std::fmt;

const SEGMENT_SUFFIX: &str = ".journal";

/// Identifies one journal segment.
///
/// Both fields are encoded in the file name, so the reader can find the
/// segment holding a given entry id from a directory listing alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId {
    /// Position of the segment in the journal; never reused.
    pub sequence: u64,
    /// Id of the first entry the segment holds (or would hold, if empty).
    pub first_entry_id: EntryId,
}

impl SegmentId {
    /// Creates a segment id.
    #[must_use]
    pub const fn new(sequence: u64, first_entry_id: EntryId) -> Self {
        Self {
            sequence,
            first_entry_id,
        }
    }

    /// Returns the id of the segment that follows this one.
    #[must_use]
    pub const fn successor(self, first_entry_id: EntryId) -> Self {
        Self::new(self.sequence + 1, first_entry_id)
    }

    /// File name of the segment.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{:08}-{:016}{SEGMENT_SUFFIX}",
            self.sequence,
            self.first_entry_id.as_u64()
        )
    }

    /// Parses a segment file name. Returns `None` for any other name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
        let (sequence, first) = stem.split_once('-')?;
        if sequence.len() != 8 || first.len() != 16 {
            return None;
        }
        if !sequence.bytes().chain(first.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self::new(
            sequence.parse().ok()?,
            EntryId::new(first.parse().ok()?),
        ))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Returns the index of the first segment that may hold `from`.
///
/// `segments` must be sorted by sequence. Entry ids increase with sequence,
/// so this is the last segment whose first entry id is at or below `from`.
#[must_use]
pub fn locate(segments: &[SegmentId], from: EntryId) -> usize {
    segments
        .partition_point(|segment| segment.first_entry_id <= from)
        .saturating_sub(1)
}
