//! # Prevail Core
//!
//! Object prevalence engine. The application state lives in memory as one
//! model value; it changes only through command objects, which are appended
//! to a segmented journal before the caller sees their result. Loading an
//! engine restores the latest snapshot and replays the journal after it.
//!
//! This crate provides:
//! - [`Command`] and [`Query`] traits and the [`CommandRegistry`] used for
//!   replay and type migration
//! - a [`Synchronizer`] granting read, upgradable and write access with
//!   timeouts
//! - a pessimistic and an optimistic [`Kernel`]
//! - the segmented journal with pluggable rollover ([`journal`])
//! - snapshots, the [`Store`] contract and [`SegmentedStore`]
//! - the [`Engine`] tying it together
//!
//! Replaying a snapshot plus every later journal entry reproduces the live
//! model exactly, provided commands are deterministic: they read time from
//! their [`ExecutionContext`] and never from the system clock.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bytes;
mod checksum;
mod command;
mod config;
mod engine;
mod error;
pub mod journal;
mod kernel;
mod manifest;
mod registry;
mod snapshot;
mod store;
mod sync;
mod types;

pub use checksum::crc32;
pub use command::{Command, CommandError, ExecutionContext, Model, Query};
pub use config::{Config, SnapshotBehavior};
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use journal::{RolloverConfig, RolloverStrategy};
pub use kernel::{Kernel, KernelKind};
pub use manifest::{StoreManifest, MANIFEST_NAME};
pub use registry::{CommandRegistry, Replayable};
pub use snapshot::SnapshotRecord;
pub use store::{SegmentedStore, Store};
pub use sync::{LockMode, ReadGuard, Synchronizer, SynchronizerKind, UpgradeGuard, WriteGuard};
pub use types::{EntryId, Revision, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
