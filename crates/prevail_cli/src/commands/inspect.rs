//! Inspect command implementation.

use super::open_store;
use prevail_core::journal::scan_segment;
use prevail_core::{SegmentedStore, Store};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store id from the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    /// Format version from the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_version: Option<String>,
    /// Creation time, Unix millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    /// Journal segments in sequence order.
    pub segments: Vec<SegmentInfo>,
    /// Snapshots in revision order.
    pub snapshots: Vec<SnapshotInfo>,
    /// Total journal size in bytes.
    pub journal_size: u64,
    /// Total entries across all segments.
    pub entry_count: u64,
}

/// One journal segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// File name.
    pub name: String,
    /// Segment sequence number.
    pub sequence: u64,
    /// Id of the first entry, from the file name.
    pub first_entry_id: u64,
    /// Id of the last complete entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_entry_id: Option<u64>,
    /// Complete entries.
    pub entries: u64,
    /// File size in bytes.
    pub size: u64,
    /// Offset of an incomplete trailing record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<u64>,
    /// Why the segment could not be scanned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One snapshot.
#[derive(Debug, Serialize)]
pub struct SnapshotInfo {
    /// Last entry id the snapshot reflects.
    pub revision: u64,
    /// When it was taken, Unix millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Encoded model size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_size: Option<usize>,
    /// Why the snapshot could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let result = inspect(&store, path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(store: &SegmentedStore, path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let manifest = store.manifest()?;

    let mut segments = Vec::new();
    for segment in store.segments()? {
        let mut info = SegmentInfo {
            name: segment.file_name(),
            sequence: segment.sequence,
            first_entry_id: segment.first_entry_id.as_u64(),
            last_entry_id: None,
            entries: 0,
            size: 0,
            truncated_at: None,
            error: None,
        };
        match scan_segment(store.directory().as_ref(), segment) {
            Ok(scan) => {
                info.last_entry_id = scan.last_entry_id.map(|id| id.as_u64());
                info.entries = scan.entries;
                info.size = scan.size;
                info.truncated_at = scan.truncated_at;
            }
            Err(e) => info.error = Some(e.to_string()),
        }
        segments.push(info);
    }

    let snapshots = store
        .snapshots()?
        .into_iter()
        .map(|revision| match store.read_snapshot(revision) {
            Ok(record) => SnapshotInfo {
                revision: revision.as_u64(),
                timestamp: Some(record.timestamp.as_millis()),
                model_size: Some(record.model.len()),
                error: None,
            },
            Err(e) => SnapshotInfo {
                revision: revision.as_u64(),
                timestamp: None,
                model_size: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        store_id: manifest.as_ref().map(|m| m.store_id.to_string()),
        format_version: manifest
            .as_ref()
            .map(|m| format!("{}.{}", m.format_version.0, m.format_version.1)),
        created_at: manifest.as_ref().map(|m| m.created_at.as_millis()),
        journal_size: segments.iter().map(|s| s.size).sum(),
        entry_count: segments.iter().map(|s| s.entries).sum(),
        segments,
        snapshots,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Prevail Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    match (&result.store_id, &result.format_version) {
        (Some(id), Some(version)) => {
            println!("Store id: {id}");
            println!("Format:   v{version}");
        }
        _ => println!("Manifest: missing"),
    }
    println!();
    println!("Journal:");
    println!("  Segments: {}", result.segments.len());
    println!("  Entries:  {}", result.entry_count);
    println!("  Size:     {}", format_size(result.journal_size));
    for segment in &result.segments {
        print!("  {} {} entries", segment.name, segment.entries);
        if let Some(last) = segment.last_entry_id {
            print!(" [{}..={}]", segment.first_entry_id, last);
        }
        print!(" {}", format_size(segment.size));
        if let Some(offset) = segment.truncated_at {
            print!(" (torn tail at {offset})");
        }
        if let Some(error) = &segment.error {
            print!(" ERROR: {error}");
        }
        println!();
    }
    println!();
    println!("Snapshots: {}", result.snapshots.len());
    for snapshot in &result.snapshots {
        match (&snapshot.error, snapshot.model_size) {
            (Some(error), _) => println!("  revision {} ERROR: {error}", snapshot.revision),
            (None, Some(size)) => println!(
                "  revision {} {}",
                snapshot.revision,
                format_size(size as u64)
            ),
            (None, None) => println!("  revision {}", snapshot.revision),
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
