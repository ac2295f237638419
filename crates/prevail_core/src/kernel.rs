//! Command execution kernel.
//!
//! The kernel owns the live model and the journal writer and is the only
//! code that mutates the model. Two execution strategies are available:
//!
//! - **Pessimistic** (default): prepare under an upgradable lock, escalate,
//!   then execute and journal under the write lock. Readers keep running
//!   during prepare.
//! - **Optimistic**: prepare under a read lock, execute against a private
//!   copy of the model with no lock held, then take the write lock and
//!   install the copy if nobody committed in between. A lost race fails with
//!   [`CoreError::WriteConflict`] and the caller may retry.
//!
//! In both, the journal append happens while the write lock is held, so
//! journal order is the order in which write locks were granted.
//!
//! ## Failures
//!
//! A command that aborts or fails is never journaled. With the pessimistic
//! kernel, changes `execute` made before failing stay in the live model;
//! commands should validate in `prepare` and mutate last. If the journal
//! append itself fails after `execute` succeeded, the model holds changes
//! that are not durable: the kernel flags itself corrupted and rejects every
//! later command with [`CoreError::ModelCorrupted`].

use crate::command::{Command, CommandError, ExecutionContext, Model, Query};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::journal::{CommandRecord, JournalEntry, JournalWriter};
use crate::registry::CommandRegistry;
use crate::sync::Synchronizer;
use crate::types::{EntryId, Revision, Timestamp};
use parking_lot::Mutex;
use prevail_codec::{deep_copy, to_cbor};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Command execution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KernelKind {
    /// Lock, prepare, execute in place.
    #[default]
    Pessimistic,
    /// Execute on a copy, commit if the model did not move.
    Optimistic,
}

/// Executes commands and queries against the live model.
pub struct Kernel<M> {
    kind: KernelKind,
    model: Synchronizer<M>,
    journal: Mutex<JournalWriter>,
    registry: Arc<CommandRegistry<M>>,
    revision: AtomicU64,
    last_timestamp: AtomicU64,
    corrupted: AtomicBool,
    ensure_safe_results: bool,
}

impl<M: Model> Kernel<M> {
    /// Creates a kernel around a model at `revision`.
    pub fn new(
        model: M,
        revision: Revision,
        journal: JournalWriter,
        registry: Arc<CommandRegistry<M>>,
        config: &Config,
    ) -> Self {
        Self {
            kind: config.kernel,
            model: Synchronizer::new(model, config.synchronizer, config.lock_timeout),
            journal: Mutex::new(journal),
            registry,
            revision: AtomicU64::new(revision.as_u64()),
            last_timestamp: AtomicU64::new(0),
            corrupted: AtomicBool::new(false),
            ensure_safe_results: config.ensure_safe_results,
        }
    }

    /// Seeds the clock floor with the timestamp of the last replayed entry.
    #[must_use]
    pub fn with_last_timestamp(self, timestamp: Timestamp) -> Self {
        self.last_timestamp
            .store(timestamp.as_millis(), Ordering::Release);
        self
    }

    /// The execution strategy.
    #[must_use]
    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    /// The command registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CommandRegistry<M>> {
        &self.registry
    }

    /// Id of the last committed entry.
    #[must_use]
    pub fn revision(&self) -> Revision {
        EntryId::new(self.revision.load(Ordering::Acquire))
    }

    /// Returns true once a journal append has failed.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    /// Executes a command and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the command's abort or failure, a lock timeout, a write
    /// conflict (optimistic kernel) or a journal error.
    pub fn execute<C: Command<M>>(&self, command: C) -> CoreResult<C::Output> {
        if self.ensure_safe_results && !command.result_isolated() {
            self.run(command, true, |output| Ok(deep_copy(&output)?))
        } else {
            self.run(command, false, Ok)
        }
    }

    /// Executes a command and returns its result encoded as CBOR.
    ///
    /// Unless the command declares its result isolated, the result is
    /// encoded before the write lock is released.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`], plus codec errors.
    pub fn execute_isolated<C: Command<M>>(&self, command: C) -> CoreResult<Vec<u8>> {
        let under_lock = !command.result_isolated();
        self.run(command, under_lock, |output| Ok(to_cbor(&output)?))
    }

    /// Runs a query under a read lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the read lock is not granted.
    pub fn query<Q: Query<M>>(&self, query: &Q) -> CoreResult<Q::Output> {
        let guard = self.model.enter_read()?;
        Ok(query.execute(&guard))
    }

    /// Runs a query and encodes its result before releasing the read lock.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout or a codec error.
    pub fn query_isolated<Q>(&self, query: &Q) -> CoreResult<Vec<u8>>
    where
        Q: Query<M>,
        Q::Output: Serialize,
    {
        let guard = self.model.enter_read()?;
        let output = query.execute(&guard);
        Ok(to_cbor(&output)?)
    }

    /// Runs a closure against the model under a read lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the read lock is not granted.
    pub fn read<R>(&self, f: impl FnOnce(&M) -> R) -> CoreResult<R> {
        let guard = self.model.enter_read()?;
        Ok(f(&guard))
    }

    /// Serializes the model together with the revision it reflects.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ModelCorrupted`] if the model may not match the
    /// journal, or a lock or codec error.
    pub fn serialize_model(&self) -> CoreResult<(Revision, Vec<u8>)> {
        let guard = self.model.enter_read()?;
        self.ensure_healthy()?;
        // Writers are excluded, so the revision matches the model.
        let revision = self.revision();
        let bytes = to_cbor(&*guard)?;
        Ok((revision, bytes))
    }

    /// Syncs and closes the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        self.journal.lock().close()
    }

    fn run<C, T>(
        &self,
        command: C,
        finish_under_lock: bool,
        finish: impl FnOnce(C::Output) -> CoreResult<T>,
    ) -> CoreResult<T>
    where
        C: Command<M>,
    {
        self.ensure_healthy()?;
        if !self.registry.contains(C::NAME, C::VERSION) {
            // It would be journaled but could never be replayed.
            return Err(CoreError::UnknownCommand {
                name: C::NAME.to_string(),
                version: C::VERSION,
            });
        }
        match self.kind {
            KernelKind::Pessimistic => self.run_pessimistic(command, finish_under_lock, finish),
            KernelKind::Optimistic => self.run_optimistic(command, finish_under_lock, finish),
        }
    }

    fn run_pessimistic<C, T>(
        &self,
        mut command: C,
        finish_under_lock: bool,
        finish: impl FnOnce(C::Output) -> CoreResult<T>,
    ) -> CoreResult<T>
    where
        C: Command<M>,
    {
        let (mut guard, record) = if C::HAS_PREPARE {
            let upgrade = self.model.enter_upgrade()?;
            command.prepare(&upgrade).map_err(prepare_error::<M, C>)?;
            let record = encode_command::<M, C>(&command)?;
            (upgrade.escalate()?, record)
        } else {
            let guard = self.model.enter_write()?;
            command.prepare(&guard).map_err(prepare_error::<M, C>)?;
            let record = encode_command::<M, C>(&command)?;
            (guard, record)
        };

        self.ensure_healthy()?;
        let ctx = self.stamp();
        let output = command
            .execute(&mut guard, &ctx)
            .map_err(execute_error::<M, C>)?;
        self.commit(JournalEntry::new(ctx.entry_id(), ctx.timestamp(), record))?;

        if finish_under_lock {
            let result = finish(output);
            drop(guard);
            result
        } else {
            drop(guard);
            finish(output)
        }
    }

    fn run_optimistic<C, T>(
        &self,
        mut command: C,
        finish_under_lock: bool,
        finish: impl FnOnce(C::Output) -> CoreResult<T>,
    ) -> CoreResult<T>
    where
        C: Command<M>,
    {
        let (mut copy, base) = {
            let guard = self.model.enter_read()?;
            command.prepare(&guard).map_err(prepare_error::<M, C>)?;
            (deep_copy(&*guard)?, self.revision())
        };
        let record = encode_command::<M, C>(&command)?;

        let ctx = ExecutionContext::new(base.next(), self.next_timestamp());
        let output = command
            .execute(&mut copy, &ctx)
            .map_err(execute_error::<M, C>)?;

        let mut guard = self.model.enter_write()?;
        self.ensure_healthy()?;
        let current = self.revision();
        if current != base {
            trace!(command = C::NAME, %base, %current, "optimistic write conflict");
            return Err(CoreError::WriteConflict {
                expected: base.as_u64(),
                actual: current.as_u64(),
            });
        }
        self.commit(JournalEntry::new(ctx.entry_id(), ctx.timestamp(), record))?;
        *guard = copy;

        if finish_under_lock {
            let result = finish(output);
            drop(guard);
            result
        } else {
            drop(guard);
            finish(output)
        }
    }

    /// Appends the entry and advances the revision. Caller holds the write
    /// lock.
    fn commit(&self, entry: JournalEntry) -> CoreResult<()> {
        let mut journal = self.journal.lock();
        if let Err(e) = journal.append(&entry) {
            self.corrupted.store(true, Ordering::Release);
            error!(
                entry_id = entry.id.as_u64(),
                command = %entry.command.name,
                error = %e,
                "journal append failed, refusing further commands"
            );
            return Err(CoreError::model_corrupted(format!(
                "journal append of {} failed: {e}",
                entry.id
            )));
        }
        self.revision.store(entry.id.as_u64(), Ordering::Release);
        self.last_timestamp
            .fetch_max(entry.timestamp.as_millis(), Ordering::AcqRel);
        trace!(
            entry_id = entry.id.as_u64(),
            command = %entry.command.name,
            "committed"
        );
        Ok(())
    }

    /// Context for the next entry. Caller holds the write lock.
    fn stamp(&self) -> ExecutionContext {
        ExecutionContext::new(self.revision().next(), self.next_timestamp())
    }

    /// Wall-clock time, never earlier than the last committed entry.
    fn next_timestamp(&self) -> Timestamp {
        let last = self.last_timestamp.load(Ordering::Acquire);
        Timestamp::from_millis(Timestamp::now().as_millis().max(last))
    }

    fn ensure_healthy(&self) -> CoreResult<()> {
        if self.is_corrupted() {
            return Err(CoreError::model_corrupted(
                "a journal append failed earlier; reload the engine",
            ));
        }
        Ok(())
    }
}

impl<M> fmt::Debug for Kernel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("revision", &self.revision.load(Ordering::Relaxed))
            .field("corrupted", &self.corrupted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn encode_command<M, C: Command<M>>(command: &C) -> CoreResult<CommandRecord> {
    Ok(CommandRecord::new(C::NAME, C::VERSION, to_cbor(command)?))
}

fn prepare_error<M, C: Command<M>>(error: CommandError) -> CoreError {
    match error {
        CommandError::Aborted(reason) => CoreError::Aborted {
            command: C::NAME.to_string(),
            reason,
        },
        CommandError::Failed(message) => CoreError::ValidationFailed {
            command: C::NAME.to_string(),
            message,
        },
    }
}

fn execute_error<M, C: Command<M>>(error: CommandError) -> CoreError {
    warn!(command = C::NAME, error = %error, "command failed during execute");
    match error {
        CommandError::Aborted(reason) => CoreError::Aborted {
            command: C::NAME.to_string(),
            reason,
        },
        CommandError::Failed(message) => CoreError::ExecutionFailed {
            command: C::NAME.to_string(),
            message,
        },
    }
}
