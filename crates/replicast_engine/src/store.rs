//! Per-channel entity replica.
//!
//! A [`ReplicaStore`] mirrors one server collection in arrival order. It is
//! rebuilt wholesale by `init` and kept current by `add`, `update` and
//! `delete`. Each store has a single writer, its channel's loop.

use crate::error::EngineError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use replicast_protocol::{ChannelMessage, ChannelName, Entity, EntityId, MessageKind};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A store shared between its channel loop and readers.
pub type SharedStore = Arc<RwLock<ReplicaStore>>;

/// Counters for one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Messages received, malformed ones included.
    pub messages: u64,
    /// `init` messages applied.
    pub inits: u64,
    /// `add` messages applied.
    pub adds: u64,
    /// `update` messages applied.
    pub updates: u64,
    /// `delete` messages that removed an entity.
    pub deletes: u64,
    /// Messages dropped as malformed.
    pub malformed: u64,
    /// Messages with an unrecognized kind.
    pub unrecognized: u64,
    /// `update`/`delete` messages naming an unknown entity.
    pub unknown_references: u64,
    /// Subscriptions opened for the channel.
    pub subscriptions: u64,
    /// Subscription failures.
    pub subscription_failures: u64,
    /// When the last message was handled.
    pub last_message_time: Option<Instant>,
    /// Last error recorded against the channel.
    pub last_error: Option<String>,
}

/// The effect of applying one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The store was replaced.
    Initialized {
        /// Entities held after the replace.
        count: usize,
        /// New generation.
        generation: u64,
    },
    /// A new entity was appended.
    Added {
        /// Entity id.
        id: EntityId,
    },
    /// An existing entity was replaced in place.
    Replaced {
        /// Entity id.
        id: EntityId,
    },
    /// Fields were merged into an entity.
    Updated {
        /// Entity id.
        id: EntityId,
        /// Names of the fields written.
        fields: Vec<String>,
    },
    /// An entity was removed.
    Deleted {
        /// The removed entity.
        entity: Entity,
    },
    /// An `update` or `delete` named an entity the store does not hold.
    UnknownReference {
        /// Message kind.
        kind: MessageKind,
        /// Referenced id.
        id: EntityId,
    },
    /// The message kind is not understood.
    Unrecognized {
        /// The `msg` value.
        kind: String,
    },
}

impl ApplyOutcome {
    /// Returns true if the store contents changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Initialized { .. }
                | Self::Added { .. }
                | Self::Replaced { .. }
                | Self::Updated { .. }
                | Self::Deleted { .. }
        )
    }
}

/// Reacts to messages applied to a store.
///
/// Observers run on the channel loop right after the apply and before the
/// next message, with a read lock on the store.
pub trait ReplicaObserver: Send + Sync {
    /// Called once per applied message.
    fn on_applied(&self, store: &ReplicaStore, outcome: &ApplyOutcome);
}

/// Arrival-ordered mirror of one server collection.
#[derive(Debug)]
pub struct ReplicaStore {
    channel: ChannelName,
    entities: IndexMap<EntityId, Entity>,
    generation: u64,
    stats: ChannelStats,
}

impl ReplicaStore {
    /// Creates an empty store for a channel.
    pub fn new(channel: ChannelName) -> Self {
        Self {
            channel,
            entities: IndexMap::new(),
            generation: 0,
            stats: ChannelStats::default(),
        }
    }

    /// Creates an empty store ready to be shared.
    pub fn shared(channel: ChannelName) -> SharedStore {
        Arc::new(RwLock::new(Self::new(channel)))
    }

    /// Returns the mirrored channel.
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Returns the store key (`<entity-type>_<organization>`).
    pub fn key(&self) -> String {
        self.channel.key()
    }

    /// Returns the number of `init` messages applied.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the number of entities held.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Looks up an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Returns true if the store holds the id.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Iterates entities in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Returns the entity ids in arrival order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().cloned().collect()
    }

    /// Returns a copy of the channel counters.
    pub fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }

    /// Replaces the collection wholesale and starts a new generation.
    ///
    /// Duplicate ids collapse: the later entity wins and keeps the position
    /// of the first occurrence.
    pub fn replace_all(&mut self, entities: Vec<Entity>) -> u64 {
        let mut next = IndexMap::with_capacity(entities.len());
        for entity in entities {
            next.insert(entity.id().clone(), entity);
        }
        self.entities = next;
        self.generation += 1;
        self.generation
    }

    /// Inserts an entity, replacing any entity with the same id in place.
    ///
    /// Returns true when the id was new.
    pub fn upsert(&mut self, entity: Entity) -> bool {
        self.entities
            .insert(entity.id().clone(), entity)
            .is_none()
    }

    /// Merges fields into an entity. Returns the written field names, or
    /// `None` if the id is unknown.
    pub fn merge(&mut self, id: &str, data: &Map<String, Value>) -> Option<Vec<String>> {
        self.entities.get_mut(id).map(|entity| entity.merge(data))
    }

    /// Removes an entity, keeping the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.entities.shift_remove(id)
    }

    /// Applies a decoded message and records it in the channel counters.
    pub fn apply(&mut self, message: ChannelMessage) -> ApplyOutcome {
        self.stats.messages += 1;
        self.stats.last_message_time = Some(Instant::now());

        match message {
            ChannelMessage::Init(entities) => {
                let generation = self.replace_all(entities);
                self.stats.inits += 1;
                ApplyOutcome::Initialized {
                    count: self.len(),
                    generation,
                }
            }
            ChannelMessage::Add(entity) => {
                let id = entity.id().clone();
                self.stats.adds += 1;
                if self.upsert(entity) {
                    ApplyOutcome::Added { id }
                } else {
                    ApplyOutcome::Replaced { id }
                }
            }
            ChannelMessage::Update { id, data } => match self.merge(id.as_str(), &data) {
                Some(fields) => {
                    self.stats.updates += 1;
                    ApplyOutcome::Updated { id, fields }
                }
                None => self.unknown_reference(MessageKind::Update, id),
            },
            ChannelMessage::Delete(id) => match self.remove(id.as_str()) {
                Some(entity) => {
                    self.stats.deletes += 1;
                    ApplyOutcome::Deleted { entity }
                }
                None => self.unknown_reference(MessageKind::Delete, id),
            },
            ChannelMessage::Unrecognized { kind, .. } => {
                self.stats.unrecognized += 1;
                debug!(channel = %self.channel, %kind, "unrecognized message kind");
                ApplyOutcome::Unrecognized { kind }
            }
        }
    }

    /// Records a message that could not be decoded.
    pub fn record_malformed(&mut self, reason: impl Into<String>) {
        self.stats.messages += 1;
        self.stats.malformed += 1;
        self.stats.last_message_time = Some(Instant::now());
        self.stats.last_error = Some(reason.into());
    }

    /// Records a newly opened subscription.
    pub fn record_subscription(&mut self) {
        self.stats.subscriptions += 1;
    }

    /// Records a subscription failure.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.stats.subscription_failures += 1;
        self.stats.last_error = Some(reason.into());
    }

    fn unknown_reference(&mut self, kind: MessageKind, id: EntityId) -> ApplyOutcome {
        let err = EngineError::UnknownReference {
            channel: self.key(),
            id: id.clone(),
        };
        warn!(kind = kind.as_str(), error = %err, "ignoring message");
        self.stats.unknown_references += 1;
        self.stats.last_error = Some(err.to_string());
        ApplyOutcome::UnknownReference { kind, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use replicast_testkit::fixtures::{add_msg, connection, delete_msg, init_msg, update_msg};
    use replicast_testkit::generators::{arb_message_sequence, PropTestConfig};
    use serde_json::json;

    fn store() -> ReplicaStore {
        ReplicaStore::new(ChannelName::new("connections", "42"))
    }

    fn apply(store: &mut ReplicaStore, raw: Value) -> ApplyOutcome {
        store.apply(ChannelMessage::decode(&raw).unwrap())
    }

    fn ids(store: &ReplicaStore) -> Vec<String> {
        store.iter().map(|e| e.id().to_string()).collect()
    }

    #[test]
    fn store_key() {
        assert_eq!(store().key(), "connections_42");
    }

    #[test]
    fn init_replaces_wholesale() {
        let mut s = store();
        apply(&mut s, add_msg(connection("x", "s0", "t0")));

        let outcome = apply(
            &mut s,
            init_msg(vec![connection("a", "s1", "t1"), connection("b", "s2", "t2")]),
        );

        assert_eq!(
            outcome,
            ApplyOutcome::Initialized {
                count: 2,
                generation: 1
            }
        );
        assert_eq!(ids(&s), vec!["a", "b"]);
        assert!(!s.contains("x"));
    }

    #[test]
    fn init_collapses_duplicates_later_wins() {
        let mut s = store();
        apply(
            &mut s,
            init_msg(vec![
                connection("a", "s1", "t1"),
                connection("b", "s2", "t2"),
                json!({"id": "a", "sourceId": "s9"}),
            ]),
        );

        assert_eq!(ids(&s), vec!["a", "b"]);
        assert_eq!(s.get("a").unwrap().get_str("sourceId"), Some("s9"));
        assert!(s.get("a").unwrap().get("targetId").is_none());
    }

    #[test]
    fn empty_init_clears_store() {
        let mut s = store();
        apply(&mut s, init_msg(vec![connection("a", "s1", "t1")]));
        apply(&mut s, init_msg(vec![]));
        assert!(s.is_empty());
        assert_eq!(s.generation(), 2);
    }

    #[test]
    fn add_is_idempotent() {
        let mut s = store();
        apply(&mut s, init_msg(vec![connection("a", "s1", "t1")]));

        let entity = connection("b", "s2", "t2");
        assert_eq!(
            apply(&mut s, add_msg(entity.clone())),
            ApplyOutcome::Added { id: "b".into() }
        );
        assert_eq!(
            apply(&mut s, add_msg(entity)),
            ApplyOutcome::Replaced { id: "b".into() }
        );
        assert_eq!(ids(&s), vec!["a", "b"]);
    }

    #[test]
    fn add_replaces_in_place() {
        let mut s = store();
        apply(
            &mut s,
            init_msg(vec![connection("a", "s1", "t1"), connection("b", "s2", "t2")]),
        );
        apply(&mut s, add_msg(json!({"id": "a", "state": "stopped"})));

        assert_eq!(ids(&s), vec!["a", "b"]);
        assert_eq!(s.get("a").unwrap().get_str("state"), Some("stopped"));
    }

    #[test]
    fn update_merges_fields() {
        let mut s = store();
        apply(
            &mut s,
            init_msg(vec![json!({"id": "c1", "state": "idle", "sourceId": "e1"})]),
        );

        let outcome = apply(&mut s, update_msg("c1", json!({"state": "active"})));
        assert_eq!(
            outcome,
            ApplyOutcome::Updated {
                id: "c1".into(),
                fields: vec!["state".into()]
            }
        );
        assert_eq!(
            s.get("c1").unwrap().to_value(),
            json!({"id": "c1", "state": "active", "sourceId": "e1"})
        );
    }

    #[test]
    fn successive_updates_accumulate() {
        let mut s = store();
        apply(&mut s, init_msg(vec![json!({"id": "c1", "state": "idle"})]));

        apply(&mut s, update_msg("c1", json!({"x": 1})));
        match apply(&mut s, update_msg("c1", json!({"y": 2, "state": "active"}))) {
            ApplyOutcome::Updated { id, mut fields } => {
                fields.sort();
                assert_eq!(id.as_str(), "c1");
                assert_eq!(fields, vec!["state", "y"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            s.get("c1").unwrap().to_value(),
            json!({"id": "c1", "state": "active", "x": 1, "y": 2})
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn update_never_overwrites_id() {
        let mut s = store();
        apply(&mut s, init_msg(vec![json!({"id": "c1"})]));
        apply(&mut s, update_msg("c1", json!({"id": "c2", "state": "x"})));

        assert!(s.contains("c1"));
        assert_eq!(s.get("c1").unwrap().get_str("id"), Some("c1"));
    }

    #[test]
    fn unknown_references_are_recorded_noops() {
        let mut s = store();
        apply(&mut s, init_msg(vec![connection("a", "s1", "t1")]));

        let outcome = apply(&mut s, update_msg("zz", json!({"state": "x"})));
        assert_eq!(
            outcome,
            ApplyOutcome::UnknownReference {
                kind: MessageKind::Update,
                id: "zz".into()
            }
        );
        let outcome = apply(&mut s, delete_msg(json!("zz")));
        assert!(!outcome.changed());

        assert_eq!(ids(&s), vec!["a"]);
        assert_eq!(s.stats().unknown_references, 2);
        assert_eq!(
            s.stats().last_error.as_deref(),
            Some("unknown entity zz on connections_42")
        );
    }

    #[test]
    fn delete_keeps_order() {
        let mut s = store();
        apply(
            &mut s,
            init_msg(vec![
                connection("a", "s1", "t1"),
                connection("b", "s2", "t2"),
                connection("c", "s3", "t3"),
            ]),
        );

        match apply(&mut s, delete_msg(json!({"id": "b"}))) {
            ApplyOutcome::Deleted { entity } => assert_eq!(entity.get_str("sourceId"), Some("s2")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ids(&s), vec!["a", "c"]);
    }

    #[test]
    fn unrecognized_and_malformed_are_counted() {
        let mut s = store();
        apply(&mut s, json!({"msg": "ping", "data": null}));
        s.record_malformed("message has no `msg` kind");

        let stats = s.stats();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.malformed, 1);
        assert!(stats.last_error.is_some());
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generation_counts_inits(messages in arb_message_sequence(40)) {
            let mut s = store();
            let mut inits = 0u64;
            let mut last = 0u64;
            for raw in messages {
                if let Ok(message) = ChannelMessage::decode(&raw) {
                    if matches!(message, ChannelMessage::Init(_)) {
                        inits += 1;
                    }
                    s.apply(message);
                }
                prop_assert!(s.generation() >= last);
                last = s.generation();
            }
            prop_assert_eq!(s.generation(), inits);
        }

        #[test]
        fn ids_stay_unique(messages in arb_message_sequence(40)) {
            let mut s = store();
            for raw in messages {
                if let Ok(message) = ChannelMessage::decode(&raw) {
                    s.apply(message);
                }
                let ids = ids(&s);
                let unique: std::collections::HashSet<_> = ids.iter().collect();
                prop_assert_eq!(unique.len(), ids.len());
                for entity in s.iter() {
                    let id = entity.get("id").and_then(EntityId::from_value);
                    prop_assert_eq!(id.as_ref(), Some(entity.id()));
                }
            }
        }
    }
}
