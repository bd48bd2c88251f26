//! Claim-code index over the endpoints replica.

use crate::store::{ApplyOutcome, ReplicaObserver, ReplicaStore};
use parking_lot::RwLock;
use replicast_protocol::{ChannelName, Entity, EntityId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// An index shared between its source channel loop and readers.
pub type SharedIndex = Arc<RwLock<ClaimIndex>>;

/// Maps claim codes to entity ids for one source channel.
///
/// The index is derived from the source channel's most recent `init` only.
/// `add`, `update` and `delete` never touch it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimIndex {
    source: ChannelName,
    claim_field: String,
    generation: u64,
    by_claim: HashMap<String, EntityId>,
    by_id: HashMap<EntityId, Entity>,
}

impl ClaimIndex {
    /// Creates an unbuilt index.
    pub fn new(source: ChannelName, claim_field: impl Into<String>) -> Self {
        Self {
            source,
            claim_field: claim_field.into(),
            generation: 0,
            by_claim: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Creates an unbuilt index ready to be shared.
    pub fn shared(source: ChannelName, claim_field: impl Into<String>) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(source, claim_field)))
    }

    /// Returns the source channel.
    pub fn source(&self) -> &ChannelName {
        &self.source
    }

    /// Returns the dotted path of the claim field.
    pub fn claim_field(&self) -> &str {
        &self.claim_field
    }

    /// Rebuilds the index from scratch.
    ///
    /// When two entities share a claim code the later one wins.
    pub fn rebuild<'a>(&mut self, entities: impl IntoIterator<Item = &'a Entity>, generation: u64) {
        self.by_claim.clear();
        self.by_id.clear();

        for entity in entities {
            if let Some(claim) = claim_code(entity, &self.claim_field) {
                self.by_claim.insert(claim, entity.id().clone());
            }
            self.by_id.insert(entity.id().clone(), entity.clone());
        }
        self.generation = generation;
    }

    /// Returns the entity id registered under a claim code.
    pub fn resolve(&self, claim: &str) -> Option<&EntityId> {
        self.by_claim.get(claim)
    }

    /// Returns the entity as of the last rebuild.
    pub fn lookup(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id)
    }

    /// Resolves a filter target given either as a claim code or an id.
    pub fn resolve_target(&self, target: &str) -> Option<EntityId> {
        self.resolve(target)
            .cloned()
            .or_else(|| self.by_id.contains_key(target).then(|| EntityId::from(target)))
    }

    /// Returns the source generation the index was built from; 0 if unbuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true once the first source `init` was indexed.
    pub fn is_built(&self) -> bool {
        self.generation > 0
    }

    /// Returns true if the index lags behind a store generation.
    pub fn is_stale(&self, store_generation: u64) -> bool {
        self.generation != store_generation
    }

    /// Returns the number of claim codes indexed.
    pub fn len(&self) -> usize {
        self.by_claim.len()
    }

    /// Returns true if no claim code is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_claim.is_empty()
    }
}

impl ReplicaObserver for RwLock<ClaimIndex> {
    fn on_applied(&self, store: &ReplicaStore, outcome: &ApplyOutcome) {
        let ApplyOutcome::Initialized { generation, .. } = outcome else {
            return;
        };

        let mut index = self.write();
        if store.channel() != index.source() {
            debug!(channel = %store.channel(), "ignoring init from non-source channel");
            return;
        }
        index.rebuild(store.iter(), *generation);
        info!(
            channel = %store.channel(),
            generation,
            claims = index.len(),
            entities = store.len(),
            "claim index rebuilt"
        );
    }
}

fn claim_code(entity: &Entity, path: &str) -> Option<String> {
    match entity.get_path(path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
