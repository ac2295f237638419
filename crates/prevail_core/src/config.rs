//! Engine configuration.

use crate::journal::RolloverConfig;
use crate::kernel::KernelKind;
use crate::sync::SynchronizerKind;
use std::time::Duration;

/// When the engine writes snapshots on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotBehavior {
    /// Only when [`Engine::snapshot`](crate::Engine::snapshot) is called.
    #[default]
    None,
    /// After a load that replayed at least one entry.
    AfterRestore,
    /// On close, if anything was committed since the last snapshot.
    OnShutdown,
}

/// Configuration for creating or loading an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How commands are executed.
    pub kernel: KernelKind,

    /// How model access is synchronized.
    pub synchronizer: SynchronizerKind,

    /// Longest time any caller waits for a lock.
    pub lock_timeout: Duration,

    /// When the journal starts a new segment.
    pub rollover: RolloverConfig,

    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Automatic snapshots.
    pub snapshot_behavior: SnapshotBehavior,

    /// Round-trip typed command results through the codec before handing
    /// them out, unless the command declares its result isolated.
    pub ensure_safe_results: bool,

    /// Format version to use for new stores.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            kernel: KernelKind::Pessimistic,
            synchronizer: SynchronizerKind::ReadWrite,
            lock_timeout: Duration::from_secs(10),
            rollover: RolloverConfig::default(),
            sync_on_commit: true,
            snapshot_behavior: SnapshotBehavior::None,
            ensure_safe_results: false,
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the kernel.
    #[must_use]
    pub const fn kernel(mut self, kind: KernelKind) -> Self {
        self.kernel = kind;
        self
    }

    /// Sets the synchronizer.
    #[must_use]
    pub const fn synchronizer(mut self, kind: SynchronizerKind) -> Self {
        self.synchronizer = kind;
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the rollover policy.
    #[must_use]
    pub const fn rollover(mut self, rollover: RolloverConfig) -> Self {
        self.rollover = rollover;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets automatic snapshot behavior.
    #[must_use]
    pub const fn snapshot_behavior(mut self, behavior: SnapshotBehavior) -> Self {
        self.snapshot_behavior = behavior;
        self
    }

    /// Sets whether typed results are copied through the codec.
    #[must_use]
    pub const fn ensure_safe_results(mut self, value: bool) -> Self {
        self.ensure_safe_results = value;
        self
    }
}
