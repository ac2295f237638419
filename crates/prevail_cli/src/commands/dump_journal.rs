//! Dump journal command implementation.

use super::open_store;
use prevail_codec::decode_value;
use prevail_core::journal::JournalEntry;
use prevail_core::{EntryId, Store};
use serde::Serialize;
use std::path::Path;

/// Journal entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Entry id.
    pub id: u64,
    /// Commit time, Unix millis.
    pub timestamp: u64,
    /// Command type name.
    pub command: String,
    /// Command schema version.
    pub version: u32,
    /// Encoded command size in bytes.
    pub payload_size: usize,
    /// Decoded command, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EntryInfo {
    fn from_entry(entry: &JournalEntry, decode: bool) -> Self {
        let payload = decode.then(|| match decode_value(&entry.command.payload) {
            Ok(value) => serde_json::to_value(&value)
                .unwrap_or_else(|e| serde_json::Value::String(format!("<{e}>"))),
            Err(e) => serde_json::Value::String(format!("<undecodable: {e}>")),
        });
        Self {
            id: entry.id.as_u64(),
            timestamp: entry.timestamp.as_millis(),
            command: entry.command.name.clone(),
            version: entry.command.version,
            payload_size: entry.command.payload.len(),
            payload,
        }
    }
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    from: u64,
    limit: Option<usize>,
    decode: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let max_entries = limit.unwrap_or(usize::MAX);

    let mut entries = Vec::new();
    for entry in store.entries_from(EntryId::new(from))?.take(max_entries) {
        entries.push(EntryInfo::from_entry(&entry?, decode));
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

fn print_text_output(entries: &[EntryInfo]) {
    println!("Journal Entries ({} total)", entries.len());
    println!("=====================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] {} {} v{} payload={} bytes",
            entry.id, entry.timestamp, entry.command, entry.version, entry.payload_size
        );
        if let Some(payload) = &entry.payload {
            print!(" {payload}");
        }
        println!();
    }
}
