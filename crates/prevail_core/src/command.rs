//! Commands, queries and the model they act on.
//!
//! A [`Command`] is a serializable description of one state transition. The
//! kernel runs it in two steps:
//!
//! 1. [`Command::prepare`] reads the model and decides whether the command
//!    can run. It may abort, and it may stash values it computed in fields
//!    marked `#[serde(skip)]` for the execute step. Prepare only runs when
//!    the command is first submitted, never on replay.
//! 2. [`Command::execute`] mutates the model. On replay it is called again
//!    with the journaled [`ExecutionContext`], so it must be deterministic:
//!    time comes from the context, never from the system clock, and there is
//!    no hidden randomness.
//!
//! A [`Query`] only reads. Queries are never journaled.
//!
//! ```
//! use prevail_core::{Command, CommandError, ExecutionContext};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Deposit {
//!     amount: u64,
//! }
//!
//! impl Command<u64> for Deposit {
//!     type Output = u64;
//!     const NAME: &'static str = "Deposit";
//!
//!     fn execute(&self, balance: &mut u64, _ctx: &ExecutionContext) -> Result<u64, CommandError> {
//!         *balance += self.amount;
//!         Ok(*balance)
//!     }
//! }
//! ```

use crate::types::{EntryId, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// A type that can be the root of a prevalent system.
///
/// Snapshots serialize the model, and the optimistic kernel copies it through
/// the codec, so it must be serde round-trippable.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Model for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Failure reported by a command's own code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command declined to run, for example because a business rule
    /// does not hold. Callers see [`CoreError::Aborted`](crate::CoreError::Aborted).
    #[error("aborted: {0}")]
    Aborted(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Creates an abort.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Creates a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Per-command values supplied by the kernel.
///
/// Fixed when the write lock is granted and journaled with the command, so a
/// replayed command sees exactly what the original did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    entry_id: EntryId,
    timestamp: Timestamp,
}

impl ExecutionContext {
    /// Creates a context.
    #[must_use]
    pub const fn new(entry_id: EntryId, timestamp: Timestamp) -> Self {
        Self {
            entry_id,
            timestamp,
        }
    }

    /// Id of the journal entry this command becomes.
    #[must_use]
    pub const fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// The command's logical time.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// A journaled state transition on model `M`.
pub trait Command<M>: Serialize + DeserializeOwned + Send + 'static {
    /// Result returned to the caller. Mutation-only commands use `()`.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Stable type name written to the journal.
    const NAME: &'static str;

    /// Schema version written to the journal. Bump it when the serialized
    /// shape changes and register an upcast for the old version.
    const VERSION: u32 = 1;

    /// Set to true when [`Self::prepare`] does real work, so the kernel runs
    /// it under an upgradable lock while readers continue. When false,
    /// prepare still runs, under the write lock.
    const HAS_PREPARE: bool = false;

    /// Validates the command against the current model.
    ///
    /// # Errors
    ///
    /// Return [`CommandError::Aborted`] to refuse the command. Nothing is
    /// journaled either way.
    fn prepare(&mut self, _model: &M) -> Result<(), CommandError> {
        Ok(())
    }

    /// Applies the command.
    ///
    /// # Errors
    ///
    /// A failure is reported to the caller and the entry is not journaled.
    /// With the pessimistic kernel, changes made before the failure stay in
    /// the model, so validate in `prepare` and mutate last.
    fn execute(&self, model: &mut M, ctx: &ExecutionContext) -> Result<Self::Output, CommandError>;

    /// Whether the result shares no state with the model. When false, the
    /// byte-level API encodes the result before releasing the write lock.
    fn result_isolated(&self) -> bool {
        false
    }
}

/// A read-only operation on model `M`.
pub trait Query<M> {
    /// Result returned to the caller.
    type Output;

    /// Runs the query.
    fn execute(&self, model: &M) -> Self::Output;
}

impl<M, F, R> Query<M> for F
where
    F: Fn(&M) -> R,
{
    type Output = R;

    fn execute(&self, model: &M) -> R {
        self(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Append(String);

    impl Command<Vec<String>> for Append {
        type Output = usize;
        const NAME: &'static str = "Append";

        fn execute(
            &self,
            model: &mut Vec<String>,
            _ctx: &ExecutionContext,
        ) -> Result<usize, CommandError> {
            model.push(self.0.clone());
            Ok(model.len())
        }
    }

    struct Length;

    impl Query<Vec<String>> for Length {
        type Output = usize;

        fn execute(&self, model: &Vec<String>) -> usize {
            model.len()
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(<Append as Command<Vec<String>>>::VERSION, 1);
        assert!(!<Append as Command<Vec<String>>>::HAS_PREPARE);
        let mut cmd = Append("x".into());
        assert!(cmd.prepare(&Vec::new()).is_ok());
        assert!(!cmd.result_isolated());
    }

    #[test]
    fn execute_uses_model() {
        let mut model = vec!["a".to_string()];
        let ctx = ExecutionContext::new(EntryId::new(1), Timestamp::from_millis(5));
        assert_eq!(Append("b".into()).execute(&mut model, &ctx).unwrap(), 2);
    }

    #[test]
    fn closures_are_queries() {
        let model = vec!["a".to_string(), "b".to_string()];
        let first = |m: &Vec<String>| m.first().cloned();
        assert_eq!(first.execute(&model), Some("a".to_string()));
        assert_eq!(Length.execute(&model), 2);
    }

    #[test]
    fn command_error_display() {
        assert_eq!(CommandError::abort("no").to_string(), "aborted: no");
        assert_eq!(CommandError::failed("boom").to_string(), "boom");
    }
}
