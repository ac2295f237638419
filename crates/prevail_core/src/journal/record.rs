//! Journal entries and their on-disk framing.

use crate::bytes::FieldReader;
use crate::checksum::crc32;
use crate::command::ExecutionContext;
use crate::error::{CoreError, CoreResult};
use crate::types::{EntryId, Timestamp};

/// Magic bytes opening every journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"PJNL";

/// Current journal record format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Size of the record header: magic, version, payload length.
pub const HEADER_SIZE: usize = 4 + 2 + 4;

/// Size of the trailing checksum.
pub const CRC_SIZE: usize = 4;

/// A serialized command together with its schema tag.
///
/// The tag (`name`, `version`) is what the command registry uses to pick a
/// decoder on replay, so old entries stay readable after the command type
/// evolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Stable command type name.
    pub name: String,
    /// Schema version of the payload.
    pub version: u32,
    /// CBOR-encoded command.
    pub payload: Vec<u8>,
}

impl CommandRecord {
    /// Creates a command record.
    pub fn new(name: impl Into<String>, version: u32, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            version,
            payload,
        }
    }
}

/// One committed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Entry id, gapless across the journal.
    pub id: EntryId,
    /// Time the write lock was granted.
    pub timestamp: Timestamp,
    /// The command.
    pub command: CommandRecord,
}

impl JournalEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(id: EntryId, timestamp: Timestamp, command: CommandRecord) -> Self {
        Self {
            id,
            timestamp,
            command,
        }
    }

    /// The context the command ran with, for replay.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.id, self.timestamp)
    }

    /// Serializes the entry payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns an error if the name or command payload is too large for its
    /// length field.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let name = self.command.name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            CoreError::invalid_operation(format!(
                "command name too long: {} bytes",
                name.len()
            ))
        })?;
        let cmd_len = u32::try_from(self.command.payload.len()).map_err(|_| {
            CoreError::invalid_operation(format!(
                "command payload too large: {} bytes",
                self.command.payload.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(8 + 8 + 2 + name.len() + 4 + 4 + self.command.payload.len());
        buf.extend_from_slice(&self.id.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.as_millis().to_le_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.command.version.to_le_bytes());
        buf.extend_from_slice(&cmd_len.to_le_bytes());
        buf.extend_from_slice(&self.command.payload);
        Ok(buf)
    }

    /// Deserializes an entry payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::JournalCorruption`] if the payload is malformed.
    pub fn decode_payload(payload: &[u8]) -> CoreResult<Self> {
        let mut reader = FieldReader::new(payload, CoreError::journal_corruption);
        let id = EntryId::new(reader.u64("entry id")?);
        let timestamp = Timestamp::from_millis(reader.u64("timestamp")?);
        let name_len = usize::from(reader.u16("name length")?);
        let name = std::str::from_utf8(reader.take(name_len, "command name")?)
            .map_err(|_| CoreError::journal_corruption("command name is not UTF-8"))?
            .to_string();
        let version = reader.u32("command version")?;
        let cmd_len = reader.u32("command length")? as usize;
        let command = reader.take(cmd_len, "command payload")?.to_vec();
        reader.finish()?;

        Ok(Self {
            id,
            timestamp,
            command: CommandRecord {
                name,
                version,
                payload: command,
            },
        })
    }

    /// Serializes the entry as a complete framed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn encode_frame(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("journal record too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Validates a record header and returns the payload length.
///
/// # Errors
///
/// Returns [`CoreError::JournalCorruption`] on bad magic or an unsupported
/// version.
pub fn parse_header(header: &[u8; HEADER_SIZE]) -> CoreResult<usize> {
    if header[0..4] != JOURNAL_MAGIC {
        return Err(CoreError::journal_corruption(format!(
            "invalid magic bytes: {:02x?}",
            &header[0..4]
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > JOURNAL_VERSION {
        return Err(CoreError::journal_corruption(format!(
            "unsupported record version {version}"
        )));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    Ok(len as usize)
}

/// Verifies the checksum of a complete frame and decodes its entry.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] if the stored and computed
/// checksums differ, or a corruption error if the payload is malformed.
pub fn decode_frame(frame: &[u8]) -> CoreResult<JournalEntry> {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return Err(CoreError::journal_corruption("frame shorter than header"));
    }
    let body_end = frame.len() - CRC_SIZE;
    let mut stored = [0u8; CRC_SIZE];
    stored.copy_from_slice(&frame[body_end..]);
    let expected = u32::from_le_bytes(stored);
    let actual = crc32(&frame[..body_end]);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    JournalEntry::decode_payload(&frame[HEADER_SIZE..body_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> JournalEntry {
        JournalEntry::new(
            EntryId::new(id),
            Timestamp::from_millis(1_700_000_000_000 + id),
            CommandRecord::new("SetValue", 2, vec![0xA2, 0x01, 0x02]),
        )
    }

    #[test]
    fn frame_roundtrip() {
        let original = entry(17);
        let frame = original.encode_frame().unwrap();
        assert_eq!(&frame[0..4], b"PJNL");
        assert_eq!(decode_frame(&frame).unwrap(), original);
    }

    #[test]
    fn header_reports_payload_length() {
        let frame = entry(1).encode_frame().unwrap();
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&frame[..HEADER_SIZE]);
        let len = parse_header(&header).unwrap();
        assert_eq!(HEADER_SIZE + len + CRC_SIZE, frame.len());
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut frame = entry(3).encode_frame().unwrap();
        frame[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            parse_header(&header),
            Err(CoreError::JournalCorruption { .. })
        ));
    }

    #[test]
    fn future_version_rejected() {
        let frame = entry(1).encode_frame().unwrap();
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&frame[..HEADER_SIZE]);
        header[4..6].copy_from_slice(&(JOURNAL_VERSION + 1).to_le_bytes());
        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn payload_trailing_bytes_rejected() {
        let mut payload = entry(5).encode_payload().unwrap();
        payload.push(0);
        assert!(JournalEntry::decode_payload(&payload).is_err());
    }

    #[test]
    fn context_carries_id_and_time() {
        let e = entry(9);
        let ctx = e.context();
        assert_eq!(ctx.entry_id(), EntryId::new(9));
        assert_eq!(ctx.timestamp(), e.timestamp);
    }
}
