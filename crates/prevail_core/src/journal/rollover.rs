//! Segment rollover strategies.
//!
//! After every append the journal writer asks its strategy whether the
//! current segment is full. Counters passed in are relative to the start of
//! the current segment; the writer resets them (and calls
//! [`RolloverStrategy::reset`]) whenever it opens a new segment.

use std::fmt;
use std::time::{Duration, Instant};

/// Decides when the current segment is closed and a new one begun.
pub trait RolloverStrategy: Send + fmt::Debug {
    /// Returns true if a new segment should begin before the next append.
    fn should_rollover(&mut self, bytes: u64, entries: u64) -> bool;

    /// Called when a new segment is opened.
    fn reset(&mut self) {}

    /// Called when an existing segment becomes current again after a
    /// restart. `age` is the time since its first entry was written.
    fn resume(&mut self, _age: Duration) {
        self.reset();
    }
}

/// Rolls over once the segment holds at least `limit` bytes.
#[derive(Debug, Clone, Copy)]
pub struct MaxBytes(pub u64);

impl RolloverStrategy for MaxBytes {
    fn should_rollover(&mut self, bytes: u64, _entries: u64) -> bool {
        bytes >= self.0
    }
}

/// Rolls over once the segment holds `limit` entries.
#[derive(Debug, Clone, Copy)]
pub struct MaxEntries(pub u64);

impl RolloverStrategy for MaxEntries {
    fn should_rollover(&mut self, _bytes: u64, entries: u64) -> bool {
        entries >= self.0
    }
}

/// Rolls over once the segment has been open for `interval`.
#[derive(Debug, Clone, Copy)]
pub struct Scheduled {
    interval: Duration,
    opened_at: Instant,
    /// Age the segment already had when this process took it over.
    carried: Duration,
}

impl Scheduled {
    /// Creates a schedule starting now.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            opened_at: Instant::now(),
            carried: Duration::ZERO,
        }
    }
}

impl RolloverStrategy for Scheduled {
    fn should_rollover(&mut self, _bytes: u64, entries: u64) -> bool {
        entries > 0 && self.carried.saturating_add(self.opened_at.elapsed()) >= self.interval
    }

    fn reset(&mut self) {
        self.opened_at = Instant::now();
        self.carried = Duration::ZERO;
    }

    fn resume(&mut self, age: Duration) {
        self.opened_at = Instant::now();
        self.carried = age;
    }
}

/// Rolls over when any child strategy says so.
#[derive(Debug, Default)]
pub struct Composite(Vec<Box<dyn RolloverStrategy>>);

impl Composite {
    /// Creates a composite with no children; it never rolls over.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child strategy.
    #[must_use]
    pub fn with(mut self, strategy: impl RolloverStrategy + 'static) -> Self {
        self.0.push(Box::new(strategy));
        self
    }

    /// Returns true if there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RolloverStrategy for Composite {
    fn should_rollover(&mut self, bytes: u64, entries: u64) -> bool {
        // Every child sees every call so stateful children stay current.
        self.0
            .iter_mut()
            .fold(false, |any, s| s.should_rollover(bytes, entries) || any)
    }

    fn reset(&mut self) {
        for strategy in &mut self.0 {
            strategy.reset();
        }
    }

    fn resume(&mut self, age: Duration) {
        for strategy in &mut self.0 {
            strategy.resume(age);
        }
    }
}

/// Declarative rollover settings, turned into a strategy by
/// [`RolloverConfig::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverConfig {
    /// Byte limit per segment.
    pub max_bytes: Option<u64>,
    /// Entry limit per segment.
    pub max_entries: Option<u64>,
    /// Maximum time a segment stays current.
    pub interval: Option<Duration>,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            max_bytes: Some(8 * 1024 * 1024), // 8 MB
            max_entries: None,
            interval: None,
        }
    }
}

impl RolloverConfig {
    /// A configuration that never rolls over.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            max_bytes: None,
            max_entries: None,
            interval: None,
        }
    }

    /// Sets the byte limit.
    #[must_use]
    pub const fn max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }

    /// Sets the entry limit.
    #[must_use]
    pub const fn max_entries(mut self, limit: u64) -> Self {
        self.max_entries = Some(limit);
        self
    }

    /// Sets the time limit.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Builds the strategy. Several limits combine as "any of".
    #[must_use]
    pub fn build(&self) -> Box<dyn RolloverStrategy> {
        let mut composite = Composite::new();
        if let Some(limit) = self.max_bytes {
            composite = composite.with(MaxBytes(limit));
        }
        if let Some(limit) = self.max_entries {
            composite = composite.with(MaxEntries(limit));
        }
        if let Some(interval) = self.interval {
            composite = composite.with(Scheduled::new(interval));
        }
        Box::new(composite)
    }
}
