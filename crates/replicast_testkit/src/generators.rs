//! Property-based test generators using proptest.
//!
//! Ids and claim codes are drawn from small pools so that generated
//! sequences hit existing entities often: replaces, merges of known ids and
//! deletes of present entities all show up within a few dozen messages.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

const ID_POOL: &[&str] = &["a", "b", "c", "d", "e"];
const CLAIM_POOL: &[&str] = &["ABC123", "XYZ789", "QRS456", "LMN000"];
const STATE_POOL: &[&str] = &["idle", "active", "stopped", "error"];

/// Strategy for entity ids as they appear on the wire: mostly strings,
/// sometimes integers.
pub fn entity_id_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => prop::sample::select(ID_POOL).prop_map(|id| json!(id)),
        1 => (1u64..4).prop_map(|n| json!(n)),
    ]
}

/// Strategy for claim codes.
pub fn claim_code_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(CLAIM_POOL).prop_map(str::to_string)
}

/// Strategy for entities with an id and a few optional fields.
pub fn entity_strategy() -> impl Strategy<Value = Value> {
    (
        entity_id_strategy(),
        prop::option::of(claim_code_strategy()),
        prop::sample::select(STATE_POOL),
        prop::option::of(prop::sample::select(ID_POOL)),
    )
        .prop_map(|(id, claim, state, source)| {
            let mut fields = Map::new();
            fields.insert("id".into(), id);
            fields.insert("state".into(), json!(state));
            if let Some(claim) = claim {
                fields.insert("claimCode".into(), json!(claim));
            }
            if let Some(source) = source {
                fields.insert("sourceId".into(), json!(source));
            }
            Value::Object(fields)
        })
}

/// Strategy for partial field sets carried by `update`.
///
/// Occasionally includes an `id` field, which a merge must ignore.
pub fn update_data_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(prop::sample::select(STATE_POOL)),
        prop::option::of(claim_code_strategy()),
        prop::option::weighted(0.1, entity_id_strategy()),
    )
        .prop_map(|(state, claim, id)| {
            let mut fields = Map::new();
            if let Some(state) = state {
                fields.insert("state".into(), json!(state));
            }
            if let Some(claim) = claim {
                fields.insert("claimCode".into(), json!(claim));
            }
            if let Some(id) = id {
                fields.insert("id".into(), id);
            }
            Value::Object(fields)
        })
}

/// Strategy for one raw channel message, malformed and unrecognized ones
/// included.
pub fn message_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        2 => prop::collection::vec(entity_strategy(), 0..6)
            .prop_map(|entities| json!({"msg": "init", "data": entities})),
        4 => entity_strategy().prop_map(|entity| json!({"msg": "add", "data": entity})),
        3 => (entity_id_strategy(), update_data_strategy())
            .prop_map(|(id, data)| json!({"msg": "update", "data": {"id": id, "data": data}})),
        2 => entity_id_strategy().prop_map(|id| json!({"msg": "delete", "data": id})),
        1 => entity_id_strategy().prop_map(|id| json!({"msg": "delete", "data": {"id": id}})),
        1 => Just(json!({"data": []})),
        1 => Just(json!({"msg": "add", "data": {"state": "idle"}})),
        1 => Just(json!({"msg": "init", "data": [{"id": "a"}, {"state": "no id"}]})),
        1 => Just(json!({"msg": "resync", "data": null})),
    ]
}

/// Strategy for a sequence of up to `max_len` raw messages.
pub fn arb_message_sequence(max_len: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(message_strategy(), 0..max_len)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
