//! The command journal.
//!
//! Every committed command is appended to the journal before the caller gets
//! its result. The journal is split into segments; exactly one segment is
//! current and open for append, the rest are immutable.
//!
//! ## Record Format
//!
//! ```text
//! | magic "PJNL" (4) | version (2) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! with the payload laid out as
//!
//! ```text
//! | entry id (8) | timestamp (8) | name len (2) | name | version (4) | cmd len (4) | cmd |
//! ```
//!
//! All integers are little-endian. The CRC covers header and payload.
//!
//! ## Recovery Policy
//!
//! Tolerated, treated as the end of that segment:
//!
//! - **Truncated header**: fewer than 10 bytes left at the end
//! - **Truncated payload**: the record length runs past the end, and no
//!   complete record follows
//!
//! Both come from a crash during an append. The partial record was never
//! acknowledged, so dropping it loses nothing.
//!
//! Fatal, loading stops with an error:
//!
//! - **CRC mismatch**
//! - **Invalid magic** or **unsupported version**
//! - **Id out of sequence** inside a segment or across segments
//! - **Overlong length** followed by an intact record: the length field was
//!   damaged, and stopping there would drop committed entries
//!
//! ## Invariants
//!
//! - records are never modified or removed after being written
//! - entry ids are gapless and strictly increasing across segments
//! - a segment with a torn tail is never appended to again

mod reader;
mod record;
mod rollover;
mod segment;
mod writer;

pub use reader::{scan_segment, JournalReader, SegmentReader, SegmentScan};
pub use record::{
    decode_frame, parse_header, CommandRecord, JournalEntry, CRC_SIZE, HEADER_SIZE,
    JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use rollover::{
    Composite, MaxBytes, MaxEntries, RolloverConfig, RolloverStrategy, Scheduled,
};
pub use segment::{locate, SegmentId};
pub use writer::JournalWriter;
