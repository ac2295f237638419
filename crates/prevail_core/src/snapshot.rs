//! Model snapshots.
//!
//! A snapshot is the serialized model plus the revision it reflects. Files
//! are named by revision (`{revision:016}.snapshot`) so the latest one is the
//! last name in sorted order. Snapshots are written with
//! [`Directory::write_atomic`](prevail_storage::Directory::write_atomic): a
//! crash mid-write leaves the previous snapshot untouched.
//!
//! Layout: `magic "PSNP" (4) | version (2) | revision (8) | timestamp (8) |
//! model len (8) | model (N) | crc32 (4)`.

use crate::bytes::FieldReader;
use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{Revision, Timestamp};

/// Magic bytes for snapshot files.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"PSNP";

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u16 = 1;

const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// A serialized model at a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Last entry id reflected in the model.
    pub revision: Revision,
    /// When the snapshot was taken.
    pub timestamp: Timestamp,
    /// CBOR-encoded model.
    pub model: Vec<u8>,
}

impl SnapshotRecord {
    /// Creates a snapshot record.
    #[must_use]
    pub fn new(revision: Revision, timestamp: Timestamp, model: Vec<u8>) -> Self {
        Self {
            revision,
            timestamp,
            model,
        }
    }

    /// File name for a snapshot at `revision`.
    #[must_use]
    pub fn file_name(revision: Revision) -> String {
        format!("{:016}{SNAPSHOT_SUFFIX}", revision.as_u64())
    }

    /// Parses a snapshot file name into its revision.
    #[must_use]
    pub fn parse_file_name(name: &str) -> Option<Revision> {
        let stem = name.strip_suffix(SNAPSHOT_SUFFIX)?;
        if stem.len() != 16 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(Revision::new)
    }

    /// Encodes the snapshot to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + 8 + 8 + 8 + self.model.len() + 4);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.revision.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.as_millis().to_le_bytes());
        buf.extend_from_slice(&(self.model.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.model);
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a snapshot from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SnapshotCorruption`] or
    /// [`CoreError::ChecksumMismatch`] if the bytes are damaged.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != SNAPSHOT_MAGIC {
            return Err(CoreError::snapshot_corruption("invalid snapshot magic"));
        }
        if data.len() < 8 {
            return Err(CoreError::snapshot_corruption("snapshot too short"));
        }
        let (body, stored) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let mut reader = FieldReader::new(&body[4..], CoreError::snapshot_corruption);
        let version = reader.u16("snapshot version")?;
        if version > SNAPSHOT_VERSION {
            return Err(CoreError::snapshot_corruption(format!(
                "unsupported snapshot version: {version}"
            )));
        }
        let revision = Revision::new(reader.u64("revision")?);
        let timestamp = Timestamp::from_millis(reader.u64("timestamp")?);
        let len = usize::try_from(reader.u64("model length")?)
            .map_err(|_| CoreError::snapshot_corruption("model length overflows"))?;
        let model = reader.take(len, "model")?.to_vec();
        reader.finish()?;

        Ok(Self {
            revision,
            timestamp,
            model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SnapshotRecord {
        SnapshotRecord::new(
            Revision::new(50),
            Timestamp::from_millis(1_700_000_000_000),
            vec![0xA1, 0x61, 0x6B, 0x01],
        )
    }

    #[test]
    fn snapshot_roundtrip() {
        let snap = record();
        assert_eq!(SnapshotRecord::decode(&snap.encode()).unwrap(), snap);
    }

    #[test]
    fn file_names_sort_by_revision() {
        let a = SnapshotRecord::file_name(Revision::new(9));
        let b = SnapshotRecord::file_name(Revision::new(10));
        assert_eq!(a, "0000000000000009.snapshot");
        assert!(a < b);
        assert_eq!(SnapshotRecord::parse_file_name(&b), Some(Revision::new(10)));
        assert_eq!(SnapshotRecord::parse_file_name("MANIFEST"), None);
        assert_eq!(SnapshotRecord::parse_file_name("12.snapshot"), None);
    }

    #[test]
    fn truncated_snapshot_rejected() {
        let bytes = record().encode();
        let result = SnapshotRecord::decode(&bytes[..bytes.len() - 6]);
        assert!(result.is_err());
    }

    #[test]
    fn corrupted_model_detected() {
        let mut bytes = record().encode();
        let at = bytes.len() - 6;
        bytes[at] ^= 0xFF;
        assert!(matches!(
            SnapshotRecord::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
