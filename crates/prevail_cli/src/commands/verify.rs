//! Verify command implementation.

use super::open_store;
use prevail_core::journal::scan_segment;
use prevail_core::{CoreError, SegmentedStore, Store};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of complete journal entries.
    pub entries_checked: u64,
    /// Number of snapshots checked.
    pub snapshots_checked: usize,
    /// Segments ending in an incomplete record.
    pub torn_tails: Vec<String>,
    /// Problems that make the store unloadable.
    pub errors: Vec<String>,
    /// Problems a load tolerates.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self, strict: bool) -> bool {
        self.errors.is_empty() && (!strict || self.torn_tails.is_empty())
    }
}

/// Runs the verify command.
pub fn run(path: &Path, strict: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let store = open_store(path)?;
    let result = verify(&store)?;
    print_result(&result);

    println!();
    if result.is_ok(strict) {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks the manifest, every segment and every snapshot.
pub fn verify(store: &SegmentedStore) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();

    match store.manifest() {
        Ok(Some(_)) => {}
        Ok(None) => result.errors.push("manifest is missing".to_string()),
        Err(e) => result.errors.push(format!("manifest: {e}")),
    }

    let mut latest_snapshot = None;
    for revision in store.snapshots()? {
        result.snapshots_checked += 1;
        match store.read_snapshot(revision) {
            Ok(_) => latest_snapshot = Some(revision),
            Err(e) => result
                .errors
                .push(format!("snapshot {}: {e}", revision.as_u64())),
        }
    }
    let Some(latest_snapshot) = latest_snapshot else {
        result.errors.push("no readable snapshot".to_string());
        return Ok(result);
    };
    // The loader starts here; gaps before this id are never read.
    let replay_from = latest_snapshot.next();

    let segments = match store.segments() {
        Ok(segments) => segments,
        Err(e) => {
            result.errors.push(e.to_string());
            return Ok(result);
        }
    };

    let mut expected = None;
    for segment in segments {
        result.segments_checked += 1;
        let scan = match scan_segment(store.directory().as_ref(), segment) {
            Ok(scan) => scan,
            Err(e) => {
                result.errors.push(e.to_string());
                expected = None;
                continue;
            }
        };
        result.entries_checked += scan.entries;

        if let Some(offset) = scan.truncated_at {
            result.torn_tails.push(
                CoreError::TruncatedSegment {
                    segment: segment.file_name(),
                    offset,
                }
                .to_string(),
            );
        }

        let first = segment.first_entry_id;
        let gap = match expected {
            Some(expected) => first != expected,
            None => result.segments_checked == 1 && first > replay_from,
        };
        if gap {
            let message = format!(
                "{} starts at entry {}, expected {}",
                segment.file_name(),
                first.as_u64(),
                expected.unwrap_or(replay_from).as_u64()
            );
            if first > replay_from {
                result.errors.push(message);
            } else {
                result
                    .warnings
                    .push(format!("{message} (covered by snapshot {})", latest_snapshot.as_u64()));
            }
        }
        expected = Some(scan.last_entry_id.map_or(first, |last| last.next()));
    }

    Ok(result)
}

fn print_result(result: &VerifyResult) {
    println!(
        "  Segments checked: {}, entries: {}, snapshots: {}",
        result.segments_checked, result.entries_checked, result.snapshots_checked
    );
    for torn in &result.torn_tails {
        println!("    TORN: {torn}");
    }
    for warning in &result.warnings {
        println!("    WARNING: {warning}");
    }
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
}
