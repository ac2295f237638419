//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod verify;

use prevail_core::SegmentedStore;
use std::path::Path;

/// Opens a store for inspection without taking its lock.
pub fn open_store(path: &Path) -> Result<SegmentedStore, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(SegmentedStore::open_read_only(path)?)
}
