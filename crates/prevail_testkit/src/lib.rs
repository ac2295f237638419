//! # Prevail Testkit
//!
//! Test utilities for Prevail.
//!
//! This crate provides:
//! - Fixture models and commands (a versioned key-value model, a counter)
//! - Engine helpers with automatic cleanup and reload
//! - Crash images and journal damage helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prevail_testkit::prelude::*;
//!
//! #[test]
//! fn survives_reload() {
//!     let mut test = TestEngine::file(KvModel::default(), kv_registry, Config::default());
//!     test.execute(Set::new("a", 1)).unwrap();
//!     test.reload();
//!     assert_eq!(test.read(|kv| kv.value("a")).unwrap(), Some(1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use prevail_core::{Config, CoreError, Engine, EntryId, KernelKind, RolloverConfig};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
