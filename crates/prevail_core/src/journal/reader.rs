//! Streaming journal readers.
//!
//! [`SegmentReader`] walks the records of one segment through a bounded read
//! buffer. [`JournalReader`] chains segments in sequence order, starting from
//! the segment that holds a requested entry id, and checks that ids stay
//! gapless across segment boundaries.

use crate::error::{CoreError, CoreResult};
use crate::journal::record::{
    decode_frame, parse_header, JournalEntry, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC,
};
use crate::journal::segment::{locate, SegmentId};
use crate::types::{EntryId, Timestamp};
use prevail_storage::{Directory, StorageBackend};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Read buffer size; larger records grow the buffer as needed.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Iterates over the records of one segment.
///
/// A trailing record cut short by a crash (incomplete header or payload)
/// ends iteration cleanly and is reported by [`Self::truncated_at`]. A bad
/// checksum, bad magic or unsupported version is an error. So is a record
/// whose length runs past the end of the segment while an intact record
/// still follows it: only the last record can be torn.
pub struct SegmentReader {
    segment: SegmentId,
    backend: Box<dyn StorageBackend>,
    size: u64,
    offset: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    truncated_at: Option<u64>,
    finished: bool,
}

impl SegmentReader {
    /// Opens a segment for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or its size cannot be
    /// read.
    pub fn open(directory: &dyn Directory, segment: SegmentId) -> CoreResult<Self> {
        let backend = directory.open_read(&segment.file_name())?;
        Self::new(segment, backend)
    }

    /// Wraps an already opened backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(segment: SegmentId, backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            segment,
            backend,
            size,
            offset: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            truncated_at: None,
            finished: false,
        })
    }

    /// The segment being read.
    #[must_use]
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Size of the segment when it was opened.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Offset of the incomplete trailing record, once reached.
    #[must_use]
    pub fn truncated_at(&self) -> Option<u64> {
        self.truncated_at
    }

    /// Returns `len` bytes at the current offset, or `None` if the segment
    /// ends first.
    fn window(&mut self, len: usize) -> CoreResult<Option<&[u8]>> {
        let remaining = self.size - self.offset;
        if (len as u64) > remaining {
            return Ok(None);
        }

        let start = usize::try_from(self.offset - self.buffer_start).unwrap_or(usize::MAX);
        let buffered = self.offset >= self.buffer_start
            && start
                .checked_add(len)
                .is_some_and(|end| end <= self.buffer.len());
        if !buffered {
            let to_read = usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(len.max(READ_BUFFER_SIZE));
            self.buffer = self.backend.read_at(self.offset, to_read)?;
            self.buffer_start = self.offset;
        }

        let start = usize::try_from(self.offset - self.buffer_start).unwrap_or(0);
        Ok(Some(&self.buffer[start..start + len]))
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, JournalEntry)>> {
        if self.offset == self.size {
            return Ok(None);
        }
        let record_offset = self.offset;

        let Some(header_bytes) = self.window(HEADER_SIZE)? else {
            return Ok(self.truncate(record_offset));
        };
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(header_bytes);
        let payload_len = parse_header(&header).map_err(|e| self.locate_error(e, record_offset))?;

        let frame_len = HEADER_SIZE + payload_len + CRC_SIZE;
        let Some(frame) = self.window(frame_len)? else {
            if let Some(next) = self.find_valid_frame(record_offset + 1)? {
                return Err(CoreError::journal_corruption(format!(
                    "{} at offset {record_offset}: record length {payload_len} runs past the \
                     end of the segment but a valid record follows at offset {next}",
                    self.segment
                )));
            }
            return Ok(self.truncate(record_offset));
        };
        let entry = decode_frame(frame).map_err(|e| self.locate_error(e, record_offset))?;

        self.offset += frame_len as u64;
        Ok(Some((record_offset, entry)))
    }

    /// Offset of the first complete, checksum-valid record starting at or
    /// after `from`.
    fn find_valid_frame(&self, from: u64) -> CoreResult<Option<u64>> {
        if from >= self.size {
            return Ok(None);
        }
        let len = usize::try_from(self.size - from).unwrap_or(usize::MAX);
        let rest = self.backend.read_at(from, len)?;

        let mut pos = 0;
        while let Some(found) = rest[pos..]
            .windows(JOURNAL_MAGIC.len())
            .position(|w| w == JOURNAL_MAGIC)
        {
            let start = pos + found;
            if let Some(frame) = frame_at(&rest, start) {
                if decode_frame(frame).is_ok() {
                    return Ok(Some(from + start as u64));
                }
            }
            pos = start + 1;
        }
        Ok(None)
    }

    fn truncate(&mut self, offset: u64) -> Option<(u64, JournalEntry)> {
        warn!(
            segment = %self.segment,
            offset,
            size = self.size,
            "incomplete trailing record, treating as end of segment"
        );
        self.truncated_at = Some(offset);
        None
    }

    fn locate_error(&self, error: CoreError, offset: u64) -> CoreError {
        match error {
            CoreError::JournalCorruption { message } => CoreError::journal_corruption(format!(
                "{} at offset {offset}: {message}",
                self.segment
            )),
            other => other,
        }
    }
}

/// The complete frame whose header starts at `start`, if the header is valid
/// and the frame fits in `data`.
fn frame_at(data: &[u8], start: usize) -> Option<&[u8]> {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(data.get(start..start.checked_add(HEADER_SIZE)?)?);
    let payload_len = parse_header(&header).ok()?;
    let end = start
        .checked_add(HEADER_SIZE)?
        .checked_add(payload_len)?
        .checked_add(CRC_SIZE)?;
    data.get(start..end)
}

impl Iterator for SegmentReader {
    type Item = CoreResult<(u64, JournalEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Summary of one segment, produced by [`scan_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentScan {
    /// The scanned segment.
    pub segment: SegmentId,
    /// Size of the segment file.
    pub size: u64,
    /// Length of the prefix made of complete records.
    pub valid_len: u64,
    /// Number of complete records.
    pub entries: u64,
    /// Id of the first complete record.
    pub first_entry_id: Option<EntryId>,
    /// Id of the last complete record.
    pub last_entry_id: Option<EntryId>,
    /// Timestamp of the first complete record.
    pub first_timestamp: Option<Timestamp>,
    /// Offset of an incomplete trailing record.
    pub truncated_at: Option<u64>,
}

impl SegmentScan {
    /// Returns true if the segment ends in an incomplete record.
    #[must_use]
    pub fn is_torn(&self) -> bool {
        self.truncated_at.is_some()
    }
}

/// Reads a whole segment and summarizes it.
///
/// # Errors
///
/// Returns an error on corruption, or if ids inside the segment are not
/// consecutive starting at the segment's first entry id.
pub fn scan_segment(directory: &dyn Directory, segment: SegmentId) -> CoreResult<SegmentScan> {
    let mut reader = SegmentReader::open(directory, segment)?;
    let mut entries = 0u64;
    let mut first = None;
    let mut first_timestamp = None;
    let mut last: Option<EntryId> = None;

    for item in reader.by_ref() {
        let (offset, entry) = item?;
        let expected = last.map_or(segment.first_entry_id, EntryId::next);
        if entry.id != expected {
            return Err(CoreError::journal_corruption(format!(
                "{segment} at offset {offset}: expected {expected}, found {}",
                entry.id
            )));
        }
        first.get_or_insert(entry.id);
        first_timestamp.get_or_insert(entry.timestamp);
        last = Some(entry.id);
        entries += 1;
    }

    Ok(SegmentScan {
        segment,
        size: reader.size(),
        valid_len: reader.valid_len(),
        entries,
        first_entry_id: first,
        last_entry_id: last,
        first_timestamp,
        truncated_at: reader.truncated_at(),
    })
}

/// Streams journal entries with id `>= from` across all segments.
///
/// Ids must run without gaps from `from` onwards. A gap, whether inside a
/// segment or between two segments, is reported as corruption.
pub struct JournalReader {
    directory: Arc<dyn Directory>,
    pending: VecDeque<SegmentId>,
    current: Option<SegmentReader>,
    from: EntryId,
    expected: EntryId,
    truncated: Vec<(SegmentId, u64)>,
    finished: bool,
}

impl JournalReader {
    /// Creates a reader over `segments`, which must be sorted by sequence.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, segments: &[SegmentId], from: EntryId) -> Self {
        let from = from.max(EntryId::new(1));
        let pending = if segments.is_empty() {
            VecDeque::new()
        } else {
            segments[locate(segments, from)..].iter().copied().collect()
        };
        Self {
            directory,
            pending,
            current: None,
            from,
            expected: from,
            truncated: Vec::new(),
            finished: false,
        }
    }

    /// Segments whose tail was incomplete, with the offset of the torn
    /// record, for segments read so far.
    #[must_use]
    pub fn truncated(&self) -> &[(SegmentId, u64)] {
        &self.truncated
    }

    /// Id of the next entry the reader expects.
    #[must_use]
    pub fn next_entry_id(&self) -> EntryId {
        self.expected
    }

    fn read_next(&mut self) -> CoreResult<Option<JournalEntry>> {
        loop {
            if self.current.is_none() {
                let Some(segment) = self.pending.pop_front() else {
                    return Ok(None);
                };
                self.current = Some(SegmentReader::open(self.directory.as_ref(), segment)?);
            }
            let Some(reader) = self.current.as_mut() else {
                continue;
            };

            match reader.next() {
                Some(item) => {
                    let (offset, entry) = item?;
                    if entry.id < self.from {
                        continue;
                    }
                    if entry.id != self.expected {
                        return Err(CoreError::journal_corruption(format!(
                            "{} at offset {offset}: expected {}, found {}",
                            reader.segment(),
                            self.expected,
                            entry.id
                        )));
                    }
                    self.expected = entry.id.next();
                    return Ok(Some(entry));
                }
                None => {
                    if let Some(offset) = reader.truncated_at() {
                        self.truncated.push((reader.segment(), offset));
                    }
                    self.current = None;
                }
            }
        }
    }
}

impl Iterator for JournalReader {
    type Item = CoreResult<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::record::CommandRecord;
    use prevail_storage::InMemoryDirectory;

    fn entry(id: u64) -> JournalEntry {
        JournalEntry::new(
            EntryId::new(id),
            Timestamp::from_millis(id * 10),
            CommandRecord::new("Increment", 1, vec![0x18, 0x2A]),
        )
    }

    fn write_segment(dir: &InMemoryDirectory, segment: SegmentId, ids: std::ops::Range<u64>) {
        let mut backend = dir.open_append(&segment.file_name()).unwrap();
        for id in ids {
            backend.append(&entry(id).encode_frame().unwrap()).unwrap();
        }
    }

    fn seg(sequence: u64, first: u64) -> SegmentId {
        SegmentId::new(sequence, EntryId::new(first))
    }

    fn ids(reader: JournalReader) -> Vec<u64> {
        reader.map(|e| e.unwrap().id.as_u64()).collect()
    }

    #[test]
    fn segment_reader_yields_offsets() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);

        let reader = SegmentReader::open(&dir, seg(1, 1)).unwrap();
        let items: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].0, 0);
        assert!(items[1].0 > 0);
        assert_eq!(items[2].1.id, EntryId::new(3));
    }

    #[test]
    fn torn_tail_ends_segment() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        let backend = dir.backend(&seg(1, 1).file_name()).unwrap();
        let full = backend.data().len();
        backend.truncate_to(full - 3);

        let scan = scan_segment(&dir, seg(1, 1)).unwrap();
        assert_eq!(scan.entries, 2);
        assert_eq!(scan.last_entry_id, Some(EntryId::new(2)));
        assert!(scan.is_torn());
        assert_eq!(scan.truncated_at, Some(scan.valid_len));
    }

    #[test]
    fn partial_header_ends_segment() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..2);
        let mut backend = dir.open_append(&seg(1, 1).file_name()).unwrap();
        backend.append(b"PJ").unwrap();

        let scan = scan_segment(&dir, seg(1, 1)).unwrap();
        assert_eq!(scan.entries, 1);
        assert!(scan.is_torn());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..3);
        dir.backend(&seg(1, 1).file_name())
            .unwrap()
            .corrupt_byte(HEADER_SIZE + 3);

        let mut reader = SegmentReader::open(&dir, seg(1, 1)).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(CoreError::ChecksumMismatch { .. }))
        ));
        assert!(reader.next().is_none());
    }

    fn frame_len() -> usize {
        entry(1).encode_frame().unwrap().len()
    }

    #[test]
    fn overlong_length_before_intact_records_is_fatal() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..6);
        // High byte of record 2's length field.
        dir.backend(&seg(1, 1).file_name())
            .unwrap()
            .corrupt_byte(frame_len() + HEADER_SIZE - 1);

        let mut reader = SegmentReader::open(&dir, seg(1, 1)).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().1.id, EntryId::new(1));
        assert!(matches!(
            reader.next(),
            Some(Err(CoreError::JournalCorruption { .. }))
        ));
        assert_eq!(reader.truncated_at(), None);

        assert!(matches!(
            scan_segment(&dir, seg(1, 1)),
            Err(CoreError::JournalCorruption { .. })
        ));
        let results: Vec<_> =
            JournalReader::new(Arc::new(dir), &[seg(1, 1)], EntryId::ZERO).collect();
        assert!(matches!(
            results.last(),
            Some(Err(CoreError::JournalCorruption { .. }))
        ));
    }

    #[test]
    fn overlong_length_on_last_record_is_torn_tail() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        dir.backend(&seg(1, 1).file_name())
            .unwrap()
            .corrupt_byte(2 * frame_len() + HEADER_SIZE - 1);

        let scan = scan_segment(&dir, seg(1, 1)).unwrap();
        assert_eq!(scan.entries, 2);
        assert_eq!(scan.truncated_at, Some(2 * frame_len() as u64));
    }

    #[test]
    fn dangling_header_followed_by_record_is_fatal() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..2);
        let mut backend = dir.open_append(&seg(1, 1).file_name()).unwrap();
        let mut header = JOURNAL_MAGIC.to_vec();
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&10_000u32.to_le_bytes());
        backend.append(&header).unwrap();
        backend.append(&entry(2).encode_frame().unwrap()).unwrap();

        assert!(matches!(
            scan_segment(&dir, seg(1, 1)),
            Err(CoreError::JournalCorruption { .. })
        ));
    }

    #[test]
    fn garbage_before_record_is_fatal() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..2);
        let mut backend = dir.open_append(&seg(1, 1).file_name()).unwrap();
        backend.append(&[0xAB; 16]).unwrap();
        backend.append(&entry(2).encode_frame().unwrap()).unwrap();

        let mut reader = SegmentReader::open(&dir, seg(1, 1)).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(
            reader.next(),
            Some(Err(CoreError::JournalCorruption { .. }))
        ));
    }

    #[test]
    fn reads_across_segments() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        write_segment(&dir, seg(2, 4), 4..7);
        let segments = [seg(1, 1), seg(2, 4)];

        let reader = JournalReader::new(Arc::new(dir), &segments, EntryId::ZERO);
        assert_eq!(ids(reader), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn starts_mid_segment() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        write_segment(&dir, seg(2, 4), 4..7);
        let segments = [seg(1, 1), seg(2, 4)];

        let reader = JournalReader::new(Arc::new(dir), &segments, EntryId::new(5));
        assert_eq!(ids(reader), vec![5, 6]);
    }

    #[test]
    fn skips_earlier_segments_without_opening_them() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(2, 4), 4..7);
        // Segment 1 is listed but absent; reading from 4 must not touch it.
        let segments = [seg(1, 1), seg(2, 4)];

        let reader = JournalReader::new(Arc::new(dir), &segments, EntryId::new(4));
        assert_eq!(ids(reader), vec![4, 5, 6]);
    }

    #[test]
    fn gap_between_segments_is_corruption() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        write_segment(&dir, seg(2, 5), 5..7);
        let segments = [seg(1, 1), seg(2, 5)];

        let results: Vec<_> = JournalReader::new(Arc::new(dir), &segments, EntryId::ZERO).collect();
        assert!(matches!(
            results.last(),
            Some(Err(CoreError::JournalCorruption { .. }))
        ));
    }

    #[test]
    fn torn_segment_followed_by_fresh_segment() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        let backend = dir.backend(&seg(1, 1).file_name()).unwrap();
        backend.truncate_to(backend.data().len() - 1);
        write_segment(&dir, seg(2, 3), 3..5);
        let segments = [seg(1, 1), seg(2, 3)];

        let mut reader = JournalReader::new(Arc::new(dir), &segments, EntryId::ZERO);
        let got: Vec<u64> = reader.by_ref().map(|e| e.unwrap().id.as_u64()).collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert_eq!(reader.truncated().len(), 1);
        assert_eq!(reader.next_entry_id(), EntryId::new(5));
    }

    #[test]
    fn from_past_end_is_empty() {
        let dir = InMemoryDirectory::new();
        write_segment(&dir, seg(1, 1), 1..4);
        let reader = JournalReader::new(Arc::new(dir), &[seg(1, 1)], EntryId::new(10));
        assert!(ids(reader).is_empty());
    }
}
