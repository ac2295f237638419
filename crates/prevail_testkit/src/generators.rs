//! Property-based test generators using proptest.
//!
//! Provides strategies for command sequences and journal configurations.

use crate::fixtures::{KvModel, Remove, Set};
use prevail_core::{CoreResult, Engine, RolloverConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for keys drawn from a small set, so operations collide.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f]").expect("Invalid regex")
}

/// One key-value operation.
#[derive(Debug, Clone)]
pub enum KvOp {
    /// Unconditional write.
    Set {
        /// Key
        key: String,
        /// Value
        value: i64,
    },
    /// Removal.
    Remove {
        /// Key
        key: String,
    },
}

impl KvOp {
    /// Executes the operation on an engine.
    pub fn apply(&self, engine: &Engine<KvModel>) -> CoreResult<()> {
        match self {
            Self::Set { key, value } => engine.execute(Set::new(key.clone(), *value)).map(|_| ()),
            Self::Remove { key } => engine.execute(Remove::new(key.clone())).map(|_| ()),
        }
    }

    /// Applies the operation to a plain map, the reference the engine is
    /// checked against.
    pub fn apply_to_map(&self, map: &mut BTreeMap<String, i64>) {
        match self {
            Self::Set { key, value } => {
                map.insert(key.clone(), *value);
            }
            Self::Remove { key } => {
                map.remove(key);
            }
        }
    }
}

/// Strategy for a single operation; writes outnumber removals.
pub fn kv_op_strategy() -> impl Strategy<Value = KvOp> {
    prop_oneof![
        3 => (key_strategy(), any::<i64>()).prop_map(|(key, value)| KvOp::Set { key, value }),
        1 => key_strategy().prop_map(|key| KvOp::Remove { key }),
    ]
}

/// Strategy for a sequence of up to `max_len` operations.
pub fn kv_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<KvOp>> {
    prop::collection::vec(kv_op_strategy(), 0..=max_len)
}

/// Strategy for rollover settings that roll often.
pub fn rollover_strategy() -> impl Strategy<Value = RolloverConfig> {
    prop_oneof![
        (1u64..8).prop_map(|k| RolloverConfig::never().max_entries(k)),
        (64u64..512).prop_map(|b| RolloverConfig::never().max_bytes(b)),
        ((1u64..8), (64u64..512))
            .prop_map(|(k, b)| RolloverConfig::never().max_entries(k).max_bytes(b)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn keys_are_single_letters(key in key_strategy()) {
            prop_assert_eq!(key.len(), 1);
        }

        #[test]
        fn op_sequences_respect_length(ops in kv_ops_strategy(20)) {
            prop_assert!(ops.len() <= 20);
        }
    }
}
