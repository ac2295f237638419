//! Model synchronization.
//!
//! Every access to the model goes through a [`Synchronizer`], which hands out
//! RAII guards in one of three modes:
//!
//! | Mode    | Shared with      | Used for                                  |
//! |---------|------------------|-------------------------------------------|
//! | Read    | Read, Upgrade    | queries, optimistic prepare, snapshots    |
//! | Upgrade | Read             | pessimistic prepare, escalates to Write   |
//! | Write   | nothing          | execute and journal append                |
//!
//! At most one Upgrade guard exists at a time, so two commands can never
//! both prepare and then deadlock escalating. Dropping a guard releases the
//! lock on every path, including early returns and panics.
//!
//! Every wait is bounded by the configured timeout; running out of time
//! surfaces as [`CoreError::LockTimeout`].

use crate::error::{CoreError, CoreResult};
use parking_lot::{
    Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Lock mode requested from a [`Synchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Shared access that may later become exclusive.
    Upgrade,
    /// Exclusive access.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Upgrade => "upgrade",
            Self::Write => "write",
        };
        f.write_str(name)
    }
}

/// Locking policy for the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SynchronizerKind {
    /// Readers proceed concurrently; writers are exclusive.
    #[default]
    ReadWrite,
    /// Every access, read or write, is exclusive.
    Exclusive,
    /// For single-threaded use. Never waits: any contention fails
    /// immediately with a lock timeout.
    Null,
}

enum Inner<M> {
    ReadWrite(RwLock<M>),
    Exclusive(Mutex<M>),
    Null(Mutex<M>),
}

/// Guards a model value according to a [`SynchronizerKind`].
pub struct Synchronizer<M> {
    inner: Inner<M>,
    timeout: Duration,
}

impl<M> Synchronizer<M> {
    /// Wraps a model.
    pub fn new(model: M, kind: SynchronizerKind, timeout: Duration) -> Self {
        let inner = match kind {
            SynchronizerKind::ReadWrite => Inner::ReadWrite(RwLock::new(model)),
            SynchronizerKind::Exclusive => Inner::Exclusive(Mutex::new(model)),
            SynchronizerKind::Null => Inner::Null(Mutex::new(model)),
        };
        Self { inner, timeout }
    }

    /// Returns the synchronization policy.
    #[must_use]
    pub fn kind(&self) -> SynchronizerKind {
        match self.inner {
            Inner::ReadWrite(_) => SynchronizerKind::ReadWrite,
            Inner::Exclusive(_) => SynchronizerKind::Exclusive,
            Inner::Null(_) => SynchronizerKind::Null,
        }
    }

    /// Returns the lock timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquires shared access.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the lock is not granted in time.
    pub fn enter_read(&self) -> CoreResult<ReadGuard<'_, M>> {
        let guard = match &self.inner {
            Inner::ReadWrite(lock) => lock.try_read_for(self.timeout).map(ReadInner::Shared),
            Inner::Exclusive(lock) => lock.try_lock_for(self.timeout).map(ReadInner::Exclusive),
            Inner::Null(lock) => lock.try_lock().map(ReadInner::Exclusive),
        };
        guard
            .map(ReadGuard)
            .ok_or_else(|| self.timed_out(LockMode::Read))
    }

    /// Acquires upgradable access.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the lock is not granted in time.
    pub fn enter_upgrade(&self) -> CoreResult<UpgradeGuard<'_, M>> {
        let guard = match &self.inner {
            Inner::ReadWrite(lock) => lock
                .try_upgradable_read_for(self.timeout)
                .map(UpgradeInner::Shared),
            Inner::Exclusive(lock) => lock
                .try_lock_for(self.timeout)
                .map(UpgradeInner::Exclusive),
            Inner::Null(lock) => lock.try_lock().map(UpgradeInner::Exclusive),
        };
        guard
            .map(|inner| UpgradeGuard {
                inner,
                timeout: self.timeout,
            })
            .ok_or_else(|| self.timed_out(LockMode::Upgrade))
    }

    /// Acquires exclusive access.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the lock is not granted in time.
    pub fn enter_write(&self) -> CoreResult<WriteGuard<'_, M>> {
        let guard = match &self.inner {
            Inner::ReadWrite(lock) => lock.try_write_for(self.timeout).map(WriteInner::Shared),
            Inner::Exclusive(lock) => lock.try_lock_for(self.timeout).map(WriteInner::Exclusive),
            Inner::Null(lock) => lock.try_lock().map(WriteInner::Exclusive),
        };
        guard
            .map(WriteGuard)
            .ok_or_else(|| self.timed_out(LockMode::Write))
    }

    /// Consumes the synchronizer and returns the model.
    pub fn into_inner(self) -> M {
        match self.inner {
            Inner::ReadWrite(lock) => lock.into_inner(),
            Inner::Exclusive(lock) | Inner::Null(lock) => lock.into_inner(),
        }
    }

    fn timed_out(&self, mode: LockMode) -> CoreError {
        let timeout = match self.inner {
            Inner::Null(_) => Duration::ZERO,
            _ => self.timeout,
        };
        CoreError::LockTimeout { mode, timeout }
    }
}

impl<M> fmt::Debug for Synchronizer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("kind", &self.kind())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

enum ReadInner<'a, M> {
    Shared(RwLockReadGuard<'a, M>),
    Exclusive(MutexGuard<'a, M>),
}

/// Shared access to the model. Released on drop.
pub struct ReadGuard<'a, M>(ReadInner<'a, M>);

impl<M> Deref for ReadGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        match &self.0 {
            ReadInner::Shared(guard) => guard,
            ReadInner::Exclusive(guard) => guard,
        }
    }
}

enum UpgradeInner<'a, M> {
    Shared(RwLockUpgradableReadGuard<'a, M>),
    Exclusive(MutexGuard<'a, M>),
}

/// Upgradable access to the model. Released on drop unless escalated.
pub struct UpgradeGuard<'a, M> {
    inner: UpgradeInner<'a, M>,
    timeout: Duration,
}

impl<'a, M> UpgradeGuard<'a, M> {
    /// Escalates to exclusive access, waiting for readers to leave.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if readers do not drain in time.
    /// The upgradable lock is released in that case.
    pub fn escalate(self) -> CoreResult<WriteGuard<'a, M>> {
        match self.inner {
            UpgradeInner::Shared(guard) => {
                match RwLockUpgradableReadGuard::try_upgrade_for(guard, self.timeout) {
                    Ok(write) => Ok(WriteGuard(WriteInner::Shared(write))),
                    Err(_released) => Err(CoreError::LockTimeout {
                        mode: LockMode::Write,
                        timeout: self.timeout,
                    }),
                }
            }
            UpgradeInner::Exclusive(guard) => Ok(WriteGuard(WriteInner::Exclusive(guard))),
        }
    }
}

impl<M> Deref for UpgradeGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        match &self.inner {
            UpgradeInner::Shared(guard) => guard,
            UpgradeInner::Exclusive(guard) => guard,
        }
    }
}

enum WriteInner<'a, M> {
    Shared(RwLockWriteGuard<'a, M>),
    Exclusive(MutexGuard<'a, M>),
}

/// Exclusive access to the model. Released on drop.
pub struct WriteGuard<'a, M>(WriteInner<'a, M>);

impl<M> Deref for WriteGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        match &self.0 {
            WriteInner::Shared(guard) => guard,
            WriteInner::Exclusive(guard) => guard,
        }
    }
}

impl<M> DerefMut for WriteGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        match &mut self.0 {
            WriteInner::Shared(guard) => guard,
            WriteInner::Exclusive(guard) => guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    fn sync(kind: SynchronizerKind) -> Synchronizer<Vec<u32>> {
        Synchronizer::new(Vec::new(), kind, SHORT)
    }

    #[test]
    fn readers_share_read_write_lock() {
        let s = sync(SynchronizerKind::ReadWrite);
        let a = s.enter_read().unwrap();
        let b = s.enter_read().unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn reader_coexists_with_upgrade() {
        let s = sync(SynchronizerKind::ReadWrite);
        let _upgrade = s.enter_upgrade().unwrap();
        assert!(s.enter_read().is_ok());
    }

    #[test]
    fn single_upgrade_slot() {
        let s = sync(SynchronizerKind::ReadWrite);
        let _first = s.enter_upgrade().unwrap();
        let second = s.enter_upgrade();
        assert!(matches!(
            second,
            Err(CoreError::LockTimeout {
                mode: LockMode::Upgrade,
                ..
            })
        ));
    }

    #[test]
    fn escalate_times_out_while_reader_held() {
        let s = sync(SynchronizerKind::ReadWrite);
        let reader = s.enter_read().unwrap();
        let upgrade = s.enter_upgrade().unwrap();
        let result = upgrade.escalate();
        assert!(matches!(
            result,
            Err(CoreError::LockTimeout {
                mode: LockMode::Write,
                ..
            })
        ));
        drop(reader);

        // The failed escalation released the upgradable lock.
        assert!(s.enter_write().is_ok());
    }

    #[test]
    fn escalate_then_mutate() {
        let s = sync(SynchronizerKind::ReadWrite);
        let upgrade = s.enter_upgrade().unwrap();
        let mut write = upgrade.escalate().unwrap();
        write.push(7);
        drop(write);
        assert_eq!(*s.enter_read().unwrap(), vec![7]);
    }

    #[test]
    fn exclusive_serializes_readers() {
        let s = sync(SynchronizerKind::Exclusive);
        let _a = s.enter_read().unwrap();
        assert!(s.enter_read().is_err());
    }

    #[test]
    fn null_never_waits() {
        let s = Synchronizer::new(0u8, SynchronizerKind::Null, Duration::from_secs(60));
        let _held = s.enter_write().unwrap();
        match s.enter_read() {
            Err(CoreError::LockTimeout { timeout, .. }) => assert_eq!(timeout, Duration::ZERO),
            _ => panic!("expected immediate lock timeout"),
        };
    }

    #[test]
    fn guard_released_on_drop() {
        let s = sync(SynchronizerKind::ReadWrite);
        {
            let _w = s.enter_write().unwrap();
        }
        assert!(s.enter_write().is_ok());
    }

    #[test]
    fn writer_waits_for_reader_on_other_thread() {
        let s = Arc::new(Synchronizer::new(
            0u64,
            SynchronizerKind::ReadWrite,
            Duration::from_secs(5),
        ));
        let reader = s.enter_read().unwrap();

        let writer = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                let mut guard = s.enter_write().unwrap();
                *guard += 1;
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(*reader, 0);
        drop(reader);
        writer.join().unwrap();
        assert_eq!(*s.enter_read().unwrap(), 1);
    }

    #[test]
    fn into_inner_returns_model() {
        let s = sync(SynchronizerKind::Exclusive);
        s.enter_write().unwrap().push(3);
        assert_eq!(s.into_inner(), vec![3]);
    }
}
