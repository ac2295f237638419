//! Command type registry.
//!
//! Replay turns journaled [`CommandRecord`]s back into commands. The registry
//! maps each schema tag, a `(name, version)` pair, to a decoder. Tags are
//! registered explicitly at startup; an unregistered tag stops a load with
//! [`CoreError::UnknownCommand`].
//!
//! When a command's serialized shape changes, bump its `VERSION`, keep the
//! old shape as a plain serde type and register an upcast from it:
//!
//! ```ignore
//! let registry = CommandRegistry::new()
//!     .with::<SetValueV2>()
//!     .with_upcast::<SetValueV1, SetValueV2>("SetValue", 1);
//! ```

use crate::command::{Command, CommandError, ExecutionContext};
use crate::error::{CoreError, CoreResult};
use crate::journal::CommandRecord;
use prevail_codec::from_cbor;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

/// A decoded command, ready to be applied during replay.
pub trait Replayable<M>: Send {
    /// Applies the command to the model, discarding its result.
    ///
    /// # Errors
    ///
    /// Returns the command's own failure.
    fn replay(&self, model: &mut M, ctx: &ExecutionContext) -> Result<(), CommandError>;
}

impl<M, C: Command<M>> Replayable<M> for C {
    fn replay(&self, model: &mut M, ctx: &ExecutionContext) -> Result<(), CommandError> {
        self.execute(model, ctx).map(|_| ())
    }
}

type Decoder<M> = Box<dyn Fn(&[u8]) -> CoreResult<Box<dyn Replayable<M>>> + Send + Sync>;

/// Maps journal schema tags to command decoders.
pub struct CommandRegistry<M> {
    decoders: HashMap<(String, u32), Decoder<M>>,
}

impl<M: 'static> CommandRegistry<M> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers command type `C` under its current name and version.
    pub fn register<C: Command<M>>(&mut self) -> &mut Self {
        self.decoders.insert(
            (C::NAME.to_string(), C::VERSION),
            Box::new(|bytes: &[u8]| -> CoreResult<Box<dyn Replayable<M>>> {
                let command: C = from_cbor(bytes)?;
                Ok(Box::new(command))
            }),
        );
        self
    }

    /// Registers an old schema tag whose payloads decode as `Old` and are
    /// converted to the current command `New`.
    pub fn register_upcast<Old, New>(&mut self, name: &str, version: u32) -> &mut Self
    where
        Old: DeserializeOwned + 'static,
        New: Command<M> + From<Old>,
    {
        self.decoders.insert(
            (name.to_string(), version),
            Box::new(|bytes: &[u8]| -> CoreResult<Box<dyn Replayable<M>>> {
                let old: Old = from_cbor(bytes)?;
                Ok(Box::new(New::from(old)))
            }),
        );
        self
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with<C: Command<M>>(mut self) -> Self {
        self.register::<C>();
        self
    }

    /// Builder form of [`Self::register_upcast`].
    #[must_use]
    pub fn with_upcast<Old, New>(mut self, name: &str, version: u32) -> Self
    where
        Old: DeserializeOwned + 'static,
        New: Command<M> + From<Old>,
    {
        self.register_upcast::<Old, New>(name, version);
        self
    }
}

impl<M> CommandRegistry<M> {
    /// Returns true if the tag has a decoder.
    #[must_use]
    pub fn contains(&self, name: &str, version: u32) -> bool {
        self.decoders.contains_key(&(name.to_string(), version))
    }

    /// Number of registered tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes a journaled command.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownCommand`] for an unregistered tag, or a
    /// codec error if the payload does not match the registered type.
    pub fn decode(&self, record: &CommandRecord) -> CoreResult<Box<dyn Replayable<M>>> {
        let decoder = self
            .decoders
            .get(&(record.name.clone(), record.version))
            .ok_or_else(|| CoreError::UnknownCommand {
                name: record.name.clone(),
                version: record.version,
            })?;
        decoder(&record.payload)
    }
}

impl<M: 'static> Default for CommandRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for CommandRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("CommandRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryId, Timestamp};
    use prevail_codec::to_cbor;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    type Model = BTreeMap<String, i64>;

    #[derive(Serialize, Deserialize)]
    struct SetV1 {
        key: String,
        value: i32,
    }

    #[derive(Serialize, Deserialize)]
    struct Set {
        key: String,
        value: i64,
        note: Option<String>,
    }

    impl From<SetV1> for Set {
        fn from(old: SetV1) -> Self {
            Self {
                key: old.key,
                value: i64::from(old.value),
                note: None,
            }
        }
    }

    impl Command<Model> for Set {
        type Output = ();
        const NAME: &'static str = "Set";
        const VERSION: u32 = 2;

        fn execute(&self, model: &mut Model, _ctx: &ExecutionContext) -> Result<(), CommandError> {
            model.insert(self.key.clone(), self.value);
            Ok(())
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(EntryId::new(1), Timestamp::from_millis(0))
    }

    fn registry() -> CommandRegistry<Model> {
        CommandRegistry::new()
            .with::<Set>()
            .with_upcast::<SetV1, Set>("Set", 1)
    }

    #[test]
    fn decodes_current_version() {
        let payload = to_cbor(&Set {
            key: "a".into(),
            value: 7,
            note: None,
        })
        .unwrap();
        let cmd = registry()
            .decode(&CommandRecord::new("Set", 2, payload))
            .unwrap();

        let mut model = Model::new();
        cmd.replay(&mut model, &ctx()).unwrap();
        assert_eq!(model.get("a"), Some(&7));
    }

    #[test]
    fn upcasts_old_version() {
        let payload = to_cbor(&SetV1 {
            key: "b".into(),
            value: -3,
        })
        .unwrap();
        let cmd = registry()
            .decode(&CommandRecord::new("Set", 1, payload))
            .unwrap();

        let mut model = Model::new();
        cmd.replay(&mut model, &ctx()).unwrap();
        assert_eq!(model.get("b"), Some(&-3));
    }

    #[test]
    fn unknown_tag_rejected() {
        let result = registry().decode(&CommandRecord::new("Set", 3, vec![]));
        assert!(matches!(
            result,
            Err(CoreError::UnknownCommand { version: 3, .. })
        ));
    }

    #[test]
    fn mismatched_payload_is_codec_error() {
        let result = registry().decode(&CommandRecord::new("Set", 2, vec![0x01]));
        assert!(matches!(result, Err(CoreError::Codec(_))));
    }

    #[test]
    fn contains_and_len() {
        let registry = registry();
        assert!(registry.contains("Set", 1));
        assert!(registry.contains("Set", 2));
        assert!(!registry.contains("Remove", 1));
        assert_eq!(registry.len(), 2);
    }
}
