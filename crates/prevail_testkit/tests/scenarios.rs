//! End-to-end engine scenarios: versioning, segmentation, recovery,
//! concurrency and damaged journals.

use prevail_core::{
    Command, CommandError, CommandRegistry, Config, CoreError, Engine, EntryId, ExecutionContext,
    KernelKind, LockMode, RolloverConfig, Store, SynchronizerKind,
};
use prevail_testkit::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn journal_ids(store: &Arc<dyn Store>) -> Vec<u64> {
    store
        .entries_from(EntryId::new(1))
        .unwrap()
        .map(|entry| entry.unwrap().id.as_u64())
        .collect()
}

#[test]
fn optimistic_versioning_on_key_value_model() {
    for kernel in [KernelKind::Pessimistic, KernelKind::Optimistic] {
        let test = TestEngine::memory(
            KvModel::default(),
            kv_registry,
            Config::default().kernel(kernel),
        );

        assert_eq!(test.execute(Set::new("a", 1)).unwrap(), 1);
        assert_eq!(test.execute(Set::expecting("a", 2, 1)).unwrap(), 2);

        let err = test.execute(Set::expecting("a", 3, 1)).unwrap_err();
        assert!(err.is_abort(), "{kernel:?}: {err}");
        assert!(err.to_string().contains("version mismatch"));

        let stored = test.read(|kv| kv.get("a").cloned()).unwrap().unwrap();
        assert_eq!((stored.value, stored.version), (2, 2));
        assert_eq!(test.revision(), EntryId::new(2));
    }
}

#[test]
fn max_entries_rollover_splits_journal_into_segments() {
    let config = Config::default()
        .rollover(RolloverConfig::never().max_entries(1000))
        .sync_on_commit(false);
    let mut test = TestEngine::file(Counter::default(), counter_registry, config);

    for _ in 0..2500 {
        test.execute(Increment(1)).unwrap();
    }

    let firsts: Vec<u64> = test
        .store()
        .segments()
        .unwrap()
        .iter()
        .map(|s| s.first_entry_id.as_u64())
        .collect();
    assert_eq!(firsts, vec![1, 1001, 2001]);
    assert_eq!(journal_segments(&test.path().unwrap()).unwrap().len(), 3);

    test.reload();
    assert_eq!(test.revision(), EntryId::new(2500));
    assert_eq!(test.read(|c| c.value).unwrap(), 2500);
}

#[test]
fn reload_after_kill_matches_continuous_session() {
    let test = TestEngine::file(KvModel::default(), kv_registry, Config::default());

    for i in 0..50 {
        test.execute(Set::new(format!("k{}", i % 7), i)).unwrap();
    }
    assert_eq!(test.snapshot().unwrap(), EntryId::new(50));
    for i in 50..60 {
        test.execute(Set::new(format!("k{}", i % 7), i)).unwrap();
    }
    let continuous = test.read(Clone::clone).unwrap();

    // The engine is still running when its files are captured.
    let image = CrashImage::capture(&test.path().unwrap()).unwrap();
    let restored = image.load(kv_registry(), Config::default()).unwrap();

    assert_eq!(restored.snapshot_revision(), EntryId::new(50));
    assert_eq!(restored.revision(), EntryId::new(60));
    assert_eq!(restored.read(Clone::clone).unwrap(), continuous);
}

#[test]
fn entry_ids_are_gapless_across_segments() {
    let config = Config::default().rollover(RolloverConfig::never().max_entries(3));
    let mut test = TestEngine::memory(KvModel::default(), kv_registry, config);

    for i in 0..10 {
        test.execute(Set::new("a", i)).unwrap();
        // Aborts in between must not consume ids.
        let _ = test.execute(Set::expecting("a", -1, 0));
    }
    test.reload();
    test.execute(Remove::new("a")).unwrap();

    assert_eq!(journal_ids(test.store()), (1..=11).collect::<Vec<_>>());
    assert_eq!(test.store().segments().unwrap().len(), 4);
}

#[test]
fn concurrent_writers_are_linearized() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    for kernel in [KernelKind::Pessimistic, KernelKind::Optimistic] {
        let engine = Arc::new(
            Engine::in_memory(
                Counter::default(),
                counter_registry(),
                Config::default().kernel(kernel),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while seen.len() < PER_THREAD {
                        match engine.execute(Increment(1)) {
                            Ok(value) => seen.push(value),
                            Err(e) if e.is_retryable() => continue,
                            Err(e) => panic!("{e}"),
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let seen = handle.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        all.sort_unstable();

        let total = (THREADS * PER_THREAD) as i64;
        assert_eq!(all, (1..=total).collect::<Vec<_>>(), "{kernel:?}");
        assert_eq!(journal_ids(engine.store()), (1..=total as u64).collect::<Vec<_>>());

        let state = engine.read(Clone::clone).unwrap();
        assert_eq!(state.applied, total as u64);
        assert_eq!(state.last_entry_id, total as u64);
    }
}

#[test]
fn aborted_command_leaves_no_trace() {
    let test = TestEngine::memory(KvModel::default(), kv_registry, Config::default());
    test.execute(Set::new("a", 1)).unwrap();
    let before = test.read(Clone::clone).unwrap();

    let err = test.execute(Set::expecting("a", 9, 7)).unwrap_err();
    assert!(matches!(err, CoreError::Aborted { ref command, .. } if command == "kv.Set"));

    assert_eq!(test.read(Clone::clone).unwrap(), before);
    assert_eq!(test.revision(), EntryId::new(1));
    assert_eq!(journal_ids(test.store()), vec![1]);
}

#[test]
fn torn_tail_is_discarded_and_journal_continues() {
    let test = TestEngine::file(KvModel::default(), kv_registry, Config::default());
    for i in 1..=5 {
        test.execute(Set::new(format!("k{i}"), i)).unwrap();
    }

    let image = CrashImage::capture(&test.path().unwrap()).unwrap();
    tear_last_segment(&image.path(), 3).unwrap();

    let engine = image.load(kv_registry(), Config::default()).unwrap();
    assert_eq!(engine.revision(), EntryId::new(4));
    assert_eq!(engine.read(|kv| kv.value("k5")).unwrap(), None);

    engine.execute(Set::new("k6", 6)).unwrap();
    drop(engine);

    assert_eq!(journal_segments(&image.path()).unwrap().len(), 2);
    let engine = image.load(kv_registry(), Config::default()).unwrap();
    assert_eq!(engine.revision(), EntryId::new(5));
    assert_eq!(engine.read(|kv| kv.value("k6")).unwrap(), Some(6));
    assert_eq!(engine.read(|kv| kv.value("k4")).unwrap(), Some(4));
}

#[test]
fn partial_header_after_clean_tail_is_ignored() {
    let test = TestEngine::file(KvModel::default(), kv_registry, Config::default());
    test.execute(Set::new("a", 1)).unwrap();

    let image = CrashImage::capture(&test.path().unwrap()).unwrap();
    append_to_last_segment(&image.path(), b"PJN").unwrap();

    let engine = image.load(kv_registry(), Config::default()).unwrap();
    assert_eq!(engine.revision(), EntryId::new(1));
    engine.execute(Set::new("b", 2)).unwrap();
    assert_eq!(journal_ids(engine.store()), vec![1, 2]);
}

#[test]
fn checksum_mismatch_stops_load() {
    let test = TestEngine::file(KvModel::default(), kv_registry, Config::default());
    for i in 0..3 {
        test.execute(Set::new("a", i)).unwrap();
    }

    let image = CrashImage::capture(&test.path().unwrap()).unwrap();
    let segment = journal_segments(&image.path()).unwrap().remove(0);
    flip_byte(&segment, 20).unwrap();

    let err = image.load(kv_registry(), Config::default()).unwrap_err();
    assert!(
        matches!(
            err,
            CoreError::ChecksumMismatch { .. } | CoreError::JournalCorruption { .. }
        ),
        "{err}"
    );
}

#[test]
fn damaged_length_mid_segment_stops_load() {
    let test = TestEngine::file(KvModel::default(), kv_registry, Config::default());
    for i in 1..=5 {
        test.execute(Set::new(format!("k{i}"), i)).unwrap();
    }

    let image = CrashImage::capture(&test.path().unwrap()).unwrap();
    let segment = journal_segments(&image.path()).unwrap().remove(0);
    let bytes = std::fs::read(&segment).unwrap();
    let first_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let second = 10 + first_len + 4;
    // High byte of the second record's length.
    flip_byte(&segment, second + 9).unwrap();

    let err = image.load(kv_registry(), Config::default()).unwrap_err();
    assert!(matches!(err, CoreError::JournalCorruption { .. }), "{err}");
}

#[test]
fn reader_blocks_writer_until_timeout() {
    let config = Config::default()
        .synchronizer(SynchronizerKind::Exclusive)
        .lock_timeout(Duration::from_millis(50));
    let engine = Arc::new(Engine::in_memory(KvModel::default(), kv_registry(), config).unwrap());

    let holding = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let reader = {
        let engine = Arc::clone(&engine);
        let holding = Arc::clone(&holding);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            engine
                .read(|_| {
                    holding.wait();
                    release.wait();
                })
                .unwrap();
        })
    };

    holding.wait();
    let err = engine.execute(Set::new("a", 1)).unwrap_err();
    assert!(matches!(
        err,
        CoreError::LockTimeout {
            mode: LockMode::Upgrade,
            ..
        }
    ));
    let err = engine.read(|kv| kv.len()).unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { mode: LockMode::Read, .. }));
    release.wait();
    reader.join().unwrap();

    engine.execute(Set::new("a", 1)).unwrap();
    assert_eq!(engine.revision(), EntryId::new(1));
}

#[test]
fn old_command_versions_replay_through_upcast() {
    let mut test = TestEngine::file(KvModel::default(), legacy_kv_registry, Config::default());
    test.execute(LegacySet {
        key: "a".into(),
        value: 7,
    })
    .unwrap();
    test.shutdown().unwrap();

    let engine = load_kv(&test.path().unwrap(), Config::default()).unwrap();
    assert_eq!(engine.read(|kv| kv.value("a")).unwrap(), Some(7));
    assert_eq!(engine.execute(Set::expecting("a", 8, 1)).unwrap(), 2);

    // The old build cannot read what the new one wrote.
    drop(engine);
    let err = Engine::load(&test.path().unwrap(), legacy_kv_registry(), Config::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownCommand { version: 2, .. }));
}

/// Blocks inside `execute` so another writer can commit first.
#[derive(Serialize, Deserialize)]
struct GatedSet {
    key: String,
    value: i64,
    #[serde(skip)]
    gate: Option<(Arc<Barrier>, Arc<Barrier>)>,
}

impl Command<KvModel> for GatedSet {
    type Output = u64;
    const NAME: &'static str = "test.GatedSet";

    fn execute(&self, model: &mut KvModel, ctx: &ExecutionContext) -> Result<u64, CommandError> {
        if let Some((entered, release)) = &self.gate {
            entered.wait();
            release.wait();
        }
        Set::new(self.key.clone(), self.value).execute(model, ctx)
    }
}

fn gated_registry() -> CommandRegistry<KvModel> {
    kv_registry().with::<GatedSet>()
}

#[test]
fn optimistic_writer_loses_race_and_retries() {
    let mut test = TestEngine::memory(
        KvModel::default(),
        gated_registry,
        Config::default().kernel(KernelKind::Optimistic),
    );

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let command = GatedSet {
        key: "a".into(),
        value: 1,
        gate: Some((Arc::clone(&entered), Arc::clone(&release))),
    };

    let engine = test.engine();
    thread::scope(|scope| {
        let handle = scope.spawn(move || engine.execute(command));

        entered.wait();
        engine.execute(Set::new("b", 2)).unwrap();
        release.wait();

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            CoreError::WriteConflict {
                expected: 0,
                actual: 1
            }
        ));
    });

    assert_eq!(test.read(|kv| kv.value("a")).unwrap(), None);
    test.execute(GatedSet {
        key: "a".into(),
        value: 1,
        gate: None,
    })
    .unwrap();

    test.reload();
    assert_eq!(test.read(|kv| kv.value("a")).unwrap(), Some(1));
    assert_eq!(test.read(|kv| kv.value("b")).unwrap(), Some(2));
}
