//! Engine: the public entry point tying a store, a kernel and recovery
//! together.

use crate::command::{Command, Model, Query};
use crate::config::{Config, SnapshotBehavior};
use crate::error::{CoreError, CoreResult};
use crate::kernel::Kernel;
use crate::registry::CommandRegistry;
use crate::snapshot::SnapshotRecord;
use crate::store::{SegmentedStore, Store};
use crate::types::{EntryId, Revision, Timestamp};
use parking_lot::{RwLock, RwLockReadGuard};
use prevail_codec::{from_cbor, to_cbor};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A prevalent system: one in-memory model made durable by a command
/// journal and snapshots.
///
/// All operations take `&self`; share the engine between threads with an
/// `Arc`. Once [`Engine::close`] has run, every operation returns
/// [`CoreError::EngineClosed`].
///
/// # Example
///
/// ```rust,ignore
/// use prevail_core::{CommandRegistry, Config, Engine};
///
/// let registry = CommandRegistry::new().with::<Deposit>();
/// let engine = Engine::open_or_create(path, registry, Config::default(), || 0u64)?;
/// let balance = engine.execute(Deposit { amount: 10 })?;
/// ```
pub struct Engine<M: Model> {
    config: Config,
    store: Arc<dyn Store>,
    kernel: Kernel<M>,
    is_open: RwLock<bool>,
    snapshot_revision: AtomicU64,
}

impl<M: Model> Engine<M> {
    /// Creates a new store at `path` holding `initial` as its genesis
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreExists`] if the directory already holds a
    /// store, [`CoreError::StoreLocked`] if another engine has it open, or
    /// an I/O error.
    pub fn create(
        path: &Path,
        initial: M,
        registry: CommandRegistry<M>,
        config: Config,
    ) -> CoreResult<Self> {
        let store = SegmentedStore::open(path, config.create_if_missing)?;
        Self::create_in(Arc::new(store), initial, registry, config)
    }

    /// Creates a new engine in an empty store.
    ///
    /// Writes the manifest and a snapshot of `initial` at revision 0, so the
    /// store can be loaded before any command has run.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreExists`] if the store is not empty.
    pub fn create_in(
        store: Arc<dyn Store>,
        initial: M,
        registry: CommandRegistry<M>,
        config: Config,
    ) -> CoreResult<Self> {
        let manifest = store.initialize(config.format_version)?;
        store.write_snapshot(&SnapshotRecord::new(
            Revision::ZERO,
            Timestamp::now(),
            to_cbor(&initial)?,
        ))?;

        let writer = store.create_journal_writer(
            EntryId::new(1),
            config.rollover.build(),
            config.sync_on_commit,
        )?;
        let kernel = Kernel::new(initial, Revision::ZERO, writer, Arc::new(registry), &config);

        info!(
            location = %store.location(),
            store_id = %manifest.store_id,
            kernel = ?config.kernel,
            "engine created"
        );
        Ok(Self::assemble(config, store, kernel, Revision::ZERO))
    }

    /// Loads the store at `path`: the latest snapshot, then every later
    /// journal entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] if there is no store at `path`,
    /// [`CoreError::UnknownCommand`] or [`CoreError::ReplayFailed`] if the
    /// journal cannot be replayed, or a corruption error.
    pub fn load(path: &Path, registry: CommandRegistry<M>, config: Config) -> CoreResult<Self> {
        if !path.is_dir() {
            return Err(CoreError::StoreNotFound {
                location: path.display().to_string(),
            });
        }
        let store = SegmentedStore::open(path, false)?;
        Self::load_from(Arc::new(store), registry, config)
    }

    /// Loads an engine from an existing store.
    ///
    /// # Errors
    ///
    /// As [`Self::load`].
    pub fn load_from(
        store: Arc<dyn Store>,
        registry: CommandRegistry<M>,
        config: Config,
    ) -> CoreResult<Self> {
        let manifest = store.manifest()?.ok_or_else(|| CoreError::StoreNotFound {
            location: store.location(),
        })?;
        manifest.check_compatible(config.format_version)?;

        let Some(snapshot) = store.latest_snapshot()? else {
            if store.segments()?.is_empty() {
                // Create was interrupted before the genesis snapshot.
                return Err(CoreError::StoreNotFound {
                    location: store.location(),
                });
            }
            return Err(CoreError::snapshot_corruption(
                "store has journal segments but no snapshot",
            ));
        };
        let mut model: M = from_cbor(&snapshot.model).map_err(|e| {
            CoreError::snapshot_corruption(format!(
                "snapshot {} does not decode: {e}",
                snapshot.revision
            ))
        })?;
        debug!(revision = %snapshot.revision, "snapshot restored");

        let mut reader = store.entries_from(snapshot.revision.next())?;
        let mut replayed = 0u64;
        let mut last_timestamp = snapshot.timestamp;
        for entry in reader.by_ref() {
            let entry = entry?;
            let command = registry.decode(&entry.command).map_err(|e| match e {
                CoreError::UnknownCommand { .. } => e,
                other => CoreError::ReplayFailed {
                    entry_id: entry.id.as_u64(),
                    command: entry.command.name.clone(),
                    message: other.to_string(),
                },
            })?;
            command
                .replay(&mut model, &entry.context())
                .map_err(|e| CoreError::ReplayFailed {
                    entry_id: entry.id.as_u64(),
                    command: entry.command.name.clone(),
                    message: e.to_string(),
                })?;
            last_timestamp = last_timestamp.max(entry.timestamp);
            replayed += 1;
        }

        let next = reader.next_entry_id();
        let revision = EntryId::new(next.as_u64() - 1);
        let writer =
            store.create_journal_writer(next, config.rollover.build(), config.sync_on_commit)?;
        let kernel = Kernel::new(model, revision, writer, Arc::new(registry), &config)
            .with_last_timestamp(last_timestamp);

        info!(
            location = %store.location(),
            store_id = %manifest.store_id,
            snapshot = %snapshot.revision,
            %revision,
            replayed,
            "engine loaded"
        );

        let engine = Self::assemble(config, store, kernel, snapshot.revision);
        if replayed > 0 && engine.config.snapshot_behavior == SnapshotBehavior::AfterRestore {
            engine.snapshot()?;
        }
        Ok(engine)
    }

    /// Loads the store at `path`, or creates it with `initial()` if there is
    /// none.
    ///
    /// # Errors
    ///
    /// As [`Self::create`] and [`Self::load`].
    pub fn open_or_create(
        path: &Path,
        registry: CommandRegistry<M>,
        config: Config,
        initial: impl FnOnce() -> M,
    ) -> CoreResult<Self> {
        let store: Arc<dyn Store> = Arc::new(SegmentedStore::open(path, config.create_if_missing)?);
        if store.exists()? {
            Self::load_from(store, registry, config)
        } else {
            Self::create_in(store, initial(), registry, config)
        }
    }

    /// Creates an engine over a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial model cannot be encoded.
    pub fn in_memory(initial: M, registry: CommandRegistry<M>, config: Config) -> CoreResult<Self> {
        Self::create_in(Arc::new(SegmentedStore::in_memory()), initial, registry, config)
    }

    fn assemble(config: Config, store: Arc<dyn Store>, kernel: Kernel<M>, snapshot: Revision) -> Self {
        Self {
            config,
            store,
            kernel,
            is_open: RwLock::new(true),
            snapshot_revision: AtomicU64::new(snapshot.as_u64()),
        }
    }

    /// Executes a command, journals it and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Aborted`], [`CoreError::ValidationFailed`] or
    /// [`CoreError::ExecutionFailed`] from the command, a lock timeout, a
    /// write conflict with the optimistic kernel, or a journal error.
    pub fn execute<C: Command<M>>(&self, command: C) -> CoreResult<C::Output> {
        let _open = self.ensure_open()?;
        self.kernel.execute(command)
    }

    /// Executes a command and returns its result encoded as CBOR.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`].
    pub fn execute_isolated<C: Command<M>>(&self, command: C) -> CoreResult<Vec<u8>> {
        let _open = self.ensure_open()?;
        self.kernel.execute_isolated(command)
    }

    /// Runs a query.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the read lock is not granted.
    pub fn query<Q: Query<M>>(&self, query: &Q) -> CoreResult<Q::Output> {
        let _open = self.ensure_open()?;
        self.kernel.query(query)
    }

    /// Runs a query and returns its result encoded as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout or a codec error.
    pub fn query_isolated<Q>(&self, query: &Q) -> CoreResult<Vec<u8>>
    where
        Q: Query<M>,
        Q::Output: Serialize,
    {
        let _open = self.ensure_open()?;
        self.kernel.query_isolated(query)
    }

    /// Runs a closure against the model under a read lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the read lock is not granted.
    pub fn read<R>(&self, f: impl FnOnce(&M) -> R) -> CoreResult<R> {
        let _open = self.ensure_open()?;
        self.kernel.read(f)
    }

    /// Writes a snapshot of the current model and returns its revision.
    ///
    /// Commands wait while the model is serialized; queries continue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ModelCorrupted`] after a failed journal append,
    /// or a lock, codec or storage error.
    pub fn snapshot(&self) -> CoreResult<Revision> {
        let _open = self.ensure_open()?;
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> CoreResult<Revision> {
        let (revision, model) = self.kernel.serialize_model()?;
        self.store
            .write_snapshot(&SnapshotRecord::new(revision, Timestamp::now(), model))?;
        self.snapshot_revision
            .fetch_max(revision.as_u64(), Ordering::AcqRel);
        info!(%revision, "snapshot taken");
        Ok(revision)
    }

    /// Id of the last committed journal entry.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.kernel.revision()
    }

    /// Revision of the newest snapshot this engine loaded or wrote.
    #[must_use]
    pub fn snapshot_revision(&self) -> Revision {
        EntryId::new(self.snapshot_revision.load(Ordering::Acquire))
    }

    /// Returns true once a journal append has failed. Reload to recover.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.kernel.is_corrupted()
    }

    /// The store backing this engine.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Returns engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks if the engine is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Closes the engine.
    ///
    /// Waits for running operations, takes a snapshot when configured with
    /// [`SnapshotBehavior::OnShutdown`], and syncs the journal. Closing twice
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the final snapshot or sync fails. The engine is
    /// closed either way.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        *is_open = false;

        let mut result = Ok(());
        if self.config.snapshot_behavior == SnapshotBehavior::OnShutdown
            && self.revision() > self.snapshot_revision()
        {
            if self.kernel.is_corrupted() {
                warn!("skipping shutdown snapshot of a corrupted model");
            } else {
                result = self.write_snapshot().map(|_| ());
            }
        }
        let closed = self.kernel.close();

        info!(location = %self.store.location(), revision = %self.revision(), "engine closed");
        result.and(closed)
    }

    fn ensure_open(&self) -> CoreResult<RwLockReadGuard<'_, bool>> {
        let guard = self.is_open.read();
        if *guard {
            Ok(guard)
        } else {
            Err(CoreError::EngineClosed)
        }
    }
}

impl<M: Model> fmt::Debug for Engine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("location", &self.store.location())
            .field("kernel", &self.kernel)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl<M: Model> Drop for Engine<M> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, ExecutionContext};
    use crate::journal::RolloverConfig;
    use crate::kernel::KernelKind;
    use serde::Deserialize;

    type Log = Vec<(u64, u64, String)>;

    /// Records its context so replay can be compared with the original run.
    #[derive(Serialize, Deserialize)]
    struct Push(String);

    impl Command<Log> for Push {
        type Output = usize;
        const NAME: &'static str = "Push";

        fn execute(&self, log: &mut Log, ctx: &ExecutionContext) -> Result<usize, CommandError> {
            log.push((ctx.entry_id().as_u64(), ctx.timestamp().as_millis(), self.0.clone()));
            Ok(log.len())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct PushNonEmpty(String);

    impl Command<Log> for PushNonEmpty {
        type Output = ();
        const NAME: &'static str = "PushNonEmpty";
        const HAS_PREPARE: bool = true;

        fn prepare(&mut self, _log: &Log) -> Result<(), CommandError> {
            if self.0.is_empty() {
                return Err(CommandError::abort("empty"));
            }
            Ok(())
        }

        fn execute(&self, log: &mut Log, ctx: &ExecutionContext) -> Result<(), CommandError> {
            log.push((ctx.entry_id().as_u64(), ctx.timestamp().as_millis(), self.0.clone()));
            Ok(())
        }
    }

    fn registry() -> CommandRegistry<Log> {
        CommandRegistry::new().with::<Push>().with::<PushNonEmpty>()
    }

    fn memory_store() -> Arc<dyn Store> {
        Arc::new(SegmentedStore::in_memory())
    }

    #[test]
    fn create_then_load_replays_journal() {
        let store = memory_store();
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        for word in ["a", "b", "c"] {
            engine.execute(Push(word.into())).unwrap();
        }
        let before = engine.read(Clone::clone).unwrap();
        engine.close().unwrap();

        let engine = Engine::load_from(store, registry(), Config::new()).unwrap();
        assert_eq!(engine.revision(), EntryId::new(3));
        assert_eq!(engine.read(Clone::clone).unwrap(), before);

        engine.execute(Push("d".into())).unwrap();
        assert_eq!(engine.read(|log| log[3].0).unwrap(), 4);
    }

    #[test]
    fn create_refuses_existing_store() {
        let store = memory_store();
        let _engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        let err = Engine::create_in(store, Log::new(), registry(), Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::StoreExists { .. }));
    }

    #[test]
    fn load_of_empty_store_fails() {
        let err = Engine::<Log>::load_from(memory_store(), registry(), Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::StoreNotFound { .. }));
    }

    #[test]
    fn interrupted_create_is_created_again() {
        let store = memory_store();
        store.initialize((1, 0)).unwrap();

        let err = Engine::<Log>::load_from(Arc::clone(&store), registry(), Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::StoreNotFound { .. }));

        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        engine.execute(Push("a".into())).unwrap();
        engine.close().unwrap();

        let engine = Engine::load_from(store, registry(), Config::new()).unwrap();
        assert_eq!(engine.revision(), EntryId::new(1));
    }

    #[test]
    fn open_or_create_recovers_manifest_only_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        SegmentedStore::open(&path, true)
            .unwrap()
            .initialize((1, 0))
            .unwrap();

        let engine = Engine::open_or_create(&path, registry(), Config::new(), Log::new).unwrap();
        engine.execute(Push("a".into())).unwrap();
        assert_eq!(engine.revision(), EntryId::new(1));
    }

    #[test]
    fn load_rejects_newer_format() {
        let store = memory_store();
        Engine::create_in(
            Arc::clone(&store),
            Log::new(),
            registry(),
            Config {
                format_version: (1, 3),
                ..Config::new()
            },
        )
        .unwrap();
        let err = Engine::<Log>::load_from(store, registry(), Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }

    #[test]
    fn unknown_command_stops_load() {
        let store = memory_store();
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        engine.execute(PushNonEmpty("x".into())).unwrap();
        drop(engine);

        let partial = CommandRegistry::new().with::<Push>();
        let err = Engine::<Log>::load_from(store, partial, Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::UnknownCommand { ref name, .. } if name == "PushNonEmpty"));
    }

    #[test]
    fn snapshot_bounds_replay() {
        let store = memory_store();
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        for i in 0..5 {
            engine.execute(Push(i.to_string())).unwrap();
        }
        assert_eq!(engine.snapshot().unwrap(), EntryId::new(5));
        engine.execute(Push("after".into())).unwrap();
        drop(engine);

        assert_eq!(store.snapshots().unwrap(), vec![EntryId::ZERO, EntryId::new(5)]);
        let engine = Engine::load_from(store, registry(), Config::new()).unwrap();
        assert_eq!(engine.snapshot_revision(), EntryId::new(5));
        assert_eq!(engine.read(Vec::len).unwrap(), 6);
    }

    #[test]
    fn after_restore_snapshot() {
        let store = memory_store();
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        engine.execute(Push("a".into())).unwrap();
        drop(engine);

        let config = Config::new().snapshot_behavior(SnapshotBehavior::AfterRestore);
        let engine = Engine::load_from(Arc::clone(&store), registry(), config).unwrap();
        assert_eq!(engine.snapshot_revision(), EntryId::new(1));
        assert_eq!(store.snapshots().unwrap().last(), Some(&EntryId::new(1)));
    }

    #[test]
    fn on_shutdown_snapshot_only_when_advanced() {
        let store = memory_store();
        let config = Config::new().snapshot_behavior(SnapshotBehavior::OnShutdown);
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), config.clone()).unwrap();
        engine.close().unwrap();
        assert_eq!(store.snapshots().unwrap(), vec![EntryId::ZERO]);

        let engine = Engine::load_from(Arc::clone(&store), registry(), config).unwrap();
        engine.execute(Push("a".into())).unwrap();
        engine.close().unwrap();
        assert_eq!(store.snapshots().unwrap(), vec![EntryId::ZERO, EntryId::new(1)]);
    }

    #[test]
    fn closed_engine_rejects_operations() {
        let engine = Engine::in_memory(Log::new(), registry(), Config::new()).unwrap();
        engine.close().unwrap();
        assert!(!engine.is_open());
        assert!(matches!(engine.execute(Push("a".into())), Err(CoreError::EngineClosed)));
        assert!(matches!(engine.read(Vec::len), Err(CoreError::EngineClosed)));
        assert!(matches!(engine.snapshot(), Err(CoreError::EngineClosed)));
        engine.close().unwrap();
    }

    #[test]
    fn abort_is_reported_and_not_journaled() {
        let store = memory_store();
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), Config::new()).unwrap();
        assert!(engine.execute(PushNonEmpty(String::new())).unwrap_err().is_abort());
        engine.execute(PushNonEmpty("ok".into())).unwrap();
        drop(engine);

        let engine = Engine::load_from(store, registry(), Config::new()).unwrap();
        assert_eq!(engine.read(|log| log[0].0).unwrap(), 1);
        assert_eq!(engine.revision(), EntryId::new(1));
    }

    #[test]
    fn replay_sees_original_context() {
        let store = memory_store();
        let config = Config::new().kernel(KernelKind::Optimistic);
        let engine = Engine::create_in(Arc::clone(&store), Log::new(), registry(), config.clone()).unwrap();
        for i in 0..10 {
            engine.execute(Push(i.to_string())).unwrap();
        }
        let original = engine.read(Clone::clone).unwrap();
        drop(engine);

        let engine = Engine::load_from(store, registry(), config).unwrap();
        assert_eq!(engine.read(Clone::clone).unwrap(), original);
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let config = Config::new().rollover(RolloverConfig::never().max_entries(4));

        let engine = Engine::open_or_create(&path, registry(), config.clone(), Log::new).unwrap();
        for i in 0..10 {
            engine.execute(Push(i.to_string())).unwrap();
        }
        assert!(matches!(
            Engine::<Log>::load(&path, registry(), config.clone()),
            Err(CoreError::StoreLocked { .. })
        ));
        drop(engine);

        let engine = Engine::open_or_create(&path, registry(), config, Log::new).unwrap();
        assert_eq!(engine.revision(), EntryId::new(10));
        assert_eq!(engine.store().segments().unwrap().len(), 3);
    }

    #[test]
    fn load_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Engine::<Log>::load(&dir.path().join("nope"), registry(), Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::StoreNotFound { .. }));
    }
}
