//! # Prevail Codec
//!
//! CBOR encoding for everything Prevail writes to disk or hands across an
//! isolation boundary: command payloads, command results and model
//! snapshots.
//!
//! Encoding is serde-driven through `ciborium`. The same input value always
//! produces the same bytes, which keeps replay and snapshot comparisons
//! stable.
//!
//! ## Usage
//!
//! ```
//! use prevail_codec::{from_cbor, to_cbor};
//!
//! let bytes = to_cbor(&("counter", 42u64)).unwrap();
//! let decoded: (String, u64) = from_cbor(&bytes).unwrap();
//! assert_eq!(decoded, ("counter".to_string(), 42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;

pub use ciborium::value::Value;
pub use error::{CodecError, CodecResult};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Encodes a value to CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value's `Serialize` implementation fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes exactly one value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR for `T`, or if bytes
/// remain after the value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let mut cursor = Cursor::new(bytes);
    let value = ciborium::from_reader(&mut cursor)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;

    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed < bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - consumed,
        });
    }
    Ok(value)
}

/// Decodes CBOR bytes into a schema-less [`Value`].
///
/// Used by tooling that inspects journal payloads without knowing the
/// command types.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    from_cbor(bytes)
}

/// Produces an independent copy of a value by encoding and decoding it.
///
/// The copy shares nothing with the original, whatever interior
/// structure `T` has.
///
/// # Errors
///
/// Returns an error if either direction of the round trip fails.
pub fn deep_copy<T: Serialize + DeserializeOwned>(value: &T) -> CodecResult<T> {
    from_cbor(&to_cbor(value)?)
}
