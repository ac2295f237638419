//! Store manifest.

use crate::bytes::FieldReader;
use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;
use uuid::Uuid;

/// Name of the manifest entry in a store directory.
pub const MANIFEST_NAME: &str = "MANIFEST";

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"PMFN";

/// Current manifest layout version.
pub const MANIFEST_VERSION: u16 = 1;

/// Identity of a store, written once when the store is created.
///
/// Layout: `magic (4) | version (2) | format major (2) | format minor (2) |
/// store id (16) | created at (8) | crc32 (4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreManifest {
    /// Store format version (major, minor).
    pub format_version: (u16, u16),
    /// Random id distinguishing this store from others.
    pub store_id: Uuid,
    /// When the store was created.
    pub created_at: Timestamp,
}

impl StoreManifest {
    /// Creates a manifest for a new store.
    #[must_use]
    pub fn new(format_version: (u16, u16)) -> Self {
        Self {
            format_version,
            store_id: Uuid::new_v4(),
            created_at: Timestamp::now(),
        }
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(38);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format_version.0.to_le_bytes());
        buf.extend_from_slice(&self.format_version.1.to_le_bytes());
        buf.extend_from_slice(self.store_id.as_bytes());
        buf.extend_from_slice(&self.created_at.as_millis().to_le_bytes());
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the bytes are not a manifest
    /// this version understands.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < 8 {
            return Err(CoreError::invalid_format("manifest too short"));
        }
        let (body, stored) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let mut reader = FieldReader::new(&body[4..], CoreError::invalid_format);
        let version = reader.u16("manifest version")?;
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let major = reader.u16("format major")?;
        let minor = reader.u16("format minor")?;
        let store_id = Uuid::from_bytes(reader.array("store id")?);
        let created_at = Timestamp::from_millis(reader.u64("created at")?);
        reader.finish()?;

        Ok(Self {
            format_version: (major, minor),
            store_id,
            created_at,
        })
    }

    /// Checks that a store written with this manifest can be opened by a
    /// build supporting `supported`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] on a major version mismatch or a
    /// newer minor version.
    pub fn check_compatible(&self, supported: (u16, u16)) -> CoreResult<()> {
        if self.format_version.0 != supported.0 || self.format_version.1 > supported.1 {
            return Err(CoreError::invalid_format(format!(
                "store format {}.{} is not readable by format {}.{}",
                self.format_version.0, self.format_version.1, supported.0, supported.1
            )));
        }
        Ok(())
    }
}
