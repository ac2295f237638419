//! Test fixtures and engine helpers.
//!
//! Provides two small models with their commands, and a [`TestEngine`]
//! wrapper that owns its storage and can reload itself.

use prevail_core::{
    Command, CommandError, CommandRegistry, Config, CoreResult, Engine, ExecutionContext, Model,
    SegmentedStore, Store,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Key-value model
// ============================================================================

/// A value together with the number of times its key was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Current value.
    pub value: i64,
    /// Starts at 1 on first write.
    pub version: u64,
    /// Timestamp of the last write, from the execution context.
    pub updated_at: u64,
}

/// A key-value model with per-key versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvModel {
    entries: BTreeMap<String, VersionedValue>,
}

impl KvModel {
    /// Returns the entry for `key`.
    pub fn get(&self, key: &str) -> Option<&VersionedValue> {
        self.entries.get(key)
    }

    /// Returns the value for `key`.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|e| e.value)
    }

    /// Returns the version of `key`, 0 if absent.
    pub fn version(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |e| e.version)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys and values, without versions.
    pub fn values(&self) -> BTreeMap<String, i64> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.value))
            .collect()
    }
}

/// Sets a key, optionally only if its version matches.
///
/// Returns the key's new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Set {
    /// Key to write.
    pub key: String,
    /// New value.
    pub value: i64,
    /// Version the caller last saw; `None` writes unconditionally.
    pub expected_version: Option<u64>,
}

impl Set {
    /// Unconditional write.
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value,
            expected_version: None,
        }
    }

    /// Write that aborts unless the key is at `version`.
    pub fn expecting(key: impl Into<String>, value: i64, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            expected_version: Some(version),
        }
    }
}

impl Command<KvModel> for Set {
    type Output = u64;
    const NAME: &'static str = "kv.Set";
    const VERSION: u32 = 2;
    const HAS_PREPARE: bool = true;

    fn prepare(&mut self, model: &KvModel) -> Result<(), CommandError> {
        if let Some(expected) = self.expected_version {
            let current = model.version(&self.key);
            if current != expected {
                return Err(CommandError::abort(format!(
                    "version mismatch on {}: expected {expected}, found {current}",
                    self.key
                )));
            }
        }
        Ok(())
    }

    fn execute(&self, model: &mut KvModel, ctx: &ExecutionContext) -> Result<u64, CommandError> {
        let entry = model
            .entries
            .entry(self.key.clone())
            .or_insert(VersionedValue {
                value: 0,
                version: 0,
                updated_at: 0,
            });
        entry.value = self.value;
        entry.version += 1;
        entry.updated_at = ctx.timestamp().as_millis();
        Ok(entry.version)
    }

    fn result_isolated(&self) -> bool {
        true
    }
}

/// The first shape of [`Set`]: 32-bit values and no version check.
///
/// Still a command so tests can journal it the way an older build did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySet {
    /// Key to write.
    pub key: String,
    /// New value.
    pub value: i32,
}

impl From<LegacySet> for Set {
    fn from(old: LegacySet) -> Self {
        Self::new(old.key, i64::from(old.value))
    }
}

impl Command<KvModel> for LegacySet {
    type Output = u64;
    const NAME: &'static str = "kv.Set";
    const VERSION: u32 = 1;

    fn execute(&self, model: &mut KvModel, ctx: &ExecutionContext) -> Result<u64, CommandError> {
        Set::from(self.clone()).execute(model, ctx)
    }
}

/// Removes a key and returns its last value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remove {
    /// Key to remove.
    pub key: String,
}

impl Remove {
    /// Creates the command.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command<KvModel> for Remove {
    type Output = Option<i64>;
    const NAME: &'static str = "kv.Remove";

    fn execute(
        &self,
        model: &mut KvModel,
        _ctx: &ExecutionContext,
    ) -> Result<Option<i64>, CommandError> {
        Ok(model.entries.remove(&self.key).map(|e| e.value))
    }
}

/// Registry for the current key-value commands, including the upcast from
/// [`LegacySet`].
pub fn kv_registry() -> CommandRegistry<KvModel> {
    CommandRegistry::new()
        .with::<Set>()
        .with::<Remove>()
        .with_upcast::<LegacySet, Set>("kv.Set", 1)
}

/// Registry of an older build that only knew [`LegacySet`].
pub fn legacy_kv_registry() -> CommandRegistry<KvModel> {
    CommandRegistry::new().with::<LegacySet>()
}

// ============================================================================
// Counter model
// ============================================================================

/// A counter that remembers the context of the last command applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Current value.
    pub value: i64,
    /// Commands applied.
    pub applied: u64,
    /// Entry id of the last command.
    pub last_entry_id: u64,
    /// Timestamp of the last command.
    pub last_timestamp: u64,
}

/// Adds to the counter; aborts if the result would go negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Increment(pub i64);

impl Command<Counter> for Increment {
    type Output = i64;
    const NAME: &'static str = "counter.Increment";
    const HAS_PREPARE: bool = true;

    fn prepare(&mut self, counter: &Counter) -> Result<(), CommandError> {
        if counter.value + self.0 < 0 {
            return Err(CommandError::abort("counter would go negative"));
        }
        Ok(())
    }

    fn execute(&self, counter: &mut Counter, ctx: &ExecutionContext) -> Result<i64, CommandError> {
        counter.value += self.0;
        counter.applied += 1;
        counter.last_entry_id = ctx.entry_id().as_u64();
        counter.last_timestamp = ctx.timestamp().as_millis();
        Ok(counter.value)
    }
}

/// Registry for counter commands.
pub fn counter_registry() -> CommandRegistry<Counter> {
    CommandRegistry::new().with::<Increment>()
}

// ============================================================================
// Engines
// ============================================================================

/// An engine with its own storage, automatic cleanup and reload.
pub struct TestEngine<M: Model> {
    engine: Option<Engine<M>>,
    registry: fn() -> CommandRegistry<M>,
    config: Config,
    store: Option<Arc<dyn Store>>,
    temp_dir: Option<TempDir>,
}

impl<M: Model> TestEngine<M> {
    /// Creates an engine over an in-memory store.
    pub fn memory(initial: M, registry: fn() -> CommandRegistry<M>, config: Config) -> Self {
        let store: Arc<dyn Store> = Arc::new(SegmentedStore::in_memory());
        let engine = Engine::create_in(Arc::clone(&store), initial, registry(), config.clone())
            .expect("Failed to create in-memory engine");
        Self {
            engine: Some(engine),
            registry,
            config,
            store: Some(store),
            temp_dir: None,
        }
    }

    /// Creates an engine over a store in a temporary directory.
    pub fn file(initial: M, registry: fn() -> CommandRegistry<M>, config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("store");
        let engine = Engine::create(&path, initial, registry(), config.clone())
            .expect("Failed to create file engine");
        Self {
            engine: Some(engine),
            registry,
            config,
            store: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// The configuration used for every load.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Closes the engine, keeping the storage.
    pub fn shutdown(&mut self) -> CoreResult<()> {
        match self.engine.take() {
            Some(engine) => engine.close(),
            None => Ok(()),
        }
    }

    /// Closes and loads the engine again.
    pub fn try_reload(&mut self) -> CoreResult<()> {
        self.try_reload_with(self.config.clone())
    }

    /// Closes and loads the engine again with a different configuration.
    pub fn try_reload_with(&mut self, config: Config) -> CoreResult<()> {
        self.shutdown()?;
        let engine = match (&self.store, self.path()) {
            (Some(store), _) => Engine::load_from(Arc::clone(store), (self.registry)(), config)?,
            (None, Some(path)) => Engine::load(&path, (self.registry)(), config)?,
            (None, None) => unreachable!("test engine without storage"),
        };
        self.engine = Some(engine);
        Ok(())
    }

    /// Closes and loads the engine again, panicking on failure.
    pub fn reload(&mut self) {
        self.try_reload().expect("Failed to reload engine");
    }

    /// The running engine.
    pub fn engine(&self) -> &Engine<M> {
        self.engine.as_ref().expect("Engine is shut down")
    }
}

impl<M: Model> std::ops::Deref for TestEngine<M> {
    type Target = Engine<M>;

    fn deref(&self) -> &Self::Target {
        self.engine()
    }
}

/// Runs a test with a temporary in-memory key-value engine.
pub fn with_kv_engine<F, R>(config: Config, f: F) -> R
where
    F: FnOnce(&Engine<KvModel>) -> R,
{
    let test = TestEngine::memory(KvModel::default(), kv_registry, config);
    f(&test)
}

/// Loads a store at `path` with the key-value registry.
pub fn load_kv(path: &Path, config: Config) -> CoreResult<Engine<KvModel>> {
    Engine::load(path, kv_registry(), config)
}
