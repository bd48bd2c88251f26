//! Membership filter over mirrored entities.
//!
//! A [`MembershipFilter`] decides whether an entity belongs to the set a
//! caller is interested in. Checks run in a fixed order and stop at the
//! first match:
//!
//! 1. `sourceId` or `targetId` equals the resolved target id
//! 2. a source-name pattern matches one of the entity's source names
//! 3. an address field equals one of the configured addresses
//! 4. the caller-supplied predicate
//!
//! The filter is immutable once built.

use crate::error::{EngineError, EngineResult};
use crate::index::ClaimIndex;
use regex::Regex;
use replicast_protocol::{Entity, EntityId};
use std::fmt;
use std::sync::Arc;

/// Default fields holding an entity's source names.
pub const DEFAULT_SOURCE_FIELDS: &[&str] = &["parameters.videoSources", "sourceName"];
/// Default fields holding an entity's network addresses.
pub const DEFAULT_ADDRESS_FIELDS: &[&str] = &["address", "parameters.address"];

/// Caller-supplied membership predicate.
pub type EntityPredicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// How source-name patterns are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMatch {
    /// The name contains the pattern.
    #[default]
    Substring,
    /// The pattern is a regular expression.
    Regex,
}

/// Configuration for a [`MembershipFilter`].
#[derive(Clone, Default)]
pub struct FilterConfig {
    /// Target entity id, or a claim code to resolve through the index.
    pub target: Option<String>,
    /// Source-name patterns.
    pub source_patterns: Vec<String>,
    /// Pattern matching mode.
    pub source_match: SourceMatch,
    /// Dotted paths holding source names; defaults apply when empty.
    pub source_fields: Vec<String>,
    /// Addresses to match.
    pub addresses: Vec<String>,
    /// Dotted paths holding addresses; defaults apply when empty.
    pub address_fields: Vec<String>,
    /// Extra predicate, checked last.
    pub predicate: Option<EntityPredicate>,
}

impl FilterConfig {
    /// Creates an empty configuration that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target id or claim code.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Adds a source-name pattern.
    pub fn with_source_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.source_patterns.push(pattern.into());
        self
    }

    /// Sets the pattern matching mode.
    pub fn with_source_match(mut self, mode: SourceMatch) -> Self {
        self.source_match = mode;
        self
    }

    /// Adds a field holding source names.
    pub fn with_source_field(mut self, path: impl Into<String>) -> Self {
        self.source_fields.push(path.into());
        self
    }

    /// Adds an address to match.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    /// Adds a field holding addresses.
    pub fn with_address_field(mut self, path: impl Into<String>) -> Self {
        self.address_fields.push(path.into());
        self
    }

    /// Sets the extra predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Returns true if no check is configured.
    pub fn is_empty(&self) -> bool {
        self.target.is_none()
            && self.source_patterns.is_empty()
            && self.addresses.is_empty()
            && self.predicate.is_none()
    }
}

impl fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterConfig")
            .field("target", &self.target)
            .field("source_patterns", &self.source_patterns)
            .field("source_match", &self.source_match)
            .field("source_fields", &self.source_fields)
            .field("addresses", &self.addresses)
            .field("address_fields", &self.address_fields)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[derive(Debug)]
enum SourcePattern {
    Substring(String),
    Regex(Regex),
}

impl SourcePattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Substring(needle) => name.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(name),
        }
    }
}

/// Which check accepted an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// `sourceId` or `targetId` is the target.
    Target,
    /// A source name matched a pattern.
    SourceName,
    /// An address matched.
    Address,
    /// The predicate returned true.
    Predicate,
}

/// Immutable membership predicate.
pub struct MembershipFilter {
    target: Option<EntityId>,
    patterns: Vec<SourcePattern>,
    source_fields: Vec<String>,
    addresses: Vec<String>,
    address_fields: Vec<String>,
    predicate: Option<EntityPredicate>,
}

impl MembershipFilter {
    /// Builds a filter; the target is taken literally as an entity id.
    ///
    /// Fails with [`EngineError::Config`] on an invalid regular expression.
    pub fn new(config: FilterConfig) -> EngineResult<Self> {
        let target = config.target.as_deref().map(EntityId::from);
        Self::build(config, target)
    }

    /// Builds a filter, resolving the target through a claim-code index.
    ///
    /// A target that is neither a known claim code nor an indexed id is kept
    /// as a literal id.
    pub fn with_index(config: FilterConfig, index: &ClaimIndex) -> EngineResult<Self> {
        let target = config.target.as_deref().map(|target| {
            index
                .resolve_target(target)
                .unwrap_or_else(|| EntityId::from(target))
        });
        Self::build(config, target)
    }

    fn build(config: FilterConfig, target: Option<EntityId>) -> EngineResult<Self> {
        let patterns = config
            .source_patterns
            .iter()
            .map(|pattern| match config.source_match {
                SourceMatch::Substring => Ok(SourcePattern::Substring(pattern.clone())),
                SourceMatch::Regex => Regex::new(pattern)
                    .map(SourcePattern::Regex)
                    .map_err(|e| EngineError::Config(format!("invalid source pattern `{pattern}`: {e}"))),
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self {
            target,
            patterns,
            source_fields: or_defaults(config.source_fields, DEFAULT_SOURCE_FIELDS),
            addresses: config.addresses,
            address_fields: or_defaults(config.address_fields, DEFAULT_ADDRESS_FIELDS),
            predicate: config.predicate,
        })
    }

    /// Returns the resolved target id.
    pub fn target(&self) -> Option<&EntityId> {
        self.target.as_ref()
    }

    /// Returns true if the entity belongs to the filtered set.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.match_reason(entity).is_some()
    }

    /// Returns the first check that accepts the entity.
    pub fn match_reason(&self, entity: &Entity) -> Option<MatchReason> {
        if let Some(target) = &self.target {
            let hit = ["sourceId", "targetId"]
                .iter()
                .filter_map(|field| entity.get(field).and_then(EntityId::from_value))
                .any(|id| &id == target);
            if hit {
                return Some(MatchReason::Target);
            }
        }

        if !self.patterns.is_empty() {
            let hit = self
                .source_fields
                .iter()
                .flat_map(|field| entity.strings_at(field))
                .any(|name| self.patterns.iter().any(|p| p.matches(name)));
            if hit {
                return Some(MatchReason::SourceName);
            }
        }

        if !self.addresses.is_empty() {
            let hit = self
                .address_fields
                .iter()
                .flat_map(|field| entity.strings_at(field))
                .any(|address| self.addresses.iter().any(|a| a == address));
            if hit {
                return Some(MatchReason::Address);
            }
        }

        match &self.predicate {
            Some(predicate) if predicate(entity) => Some(MatchReason::Predicate),
            _ => None,
        }
    }
}

impl fmt::Debug for MembershipFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipFilter")
            .field("target", &self.target)
            .field("patterns", &self.patterns)
            .field("addresses", &self.addresses)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

fn or_defaults(fields: Vec<String>, defaults: &[&str]) -> Vec<String> {
    if fields.is_empty() {
        defaults.iter().map(|f| f.to_string()).collect()
    } else {
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicast_protocol::ChannelName;
    use replicast_testkit::fixtures::{connection, detailed_connection, endpoint};
    use serde_json::json;

    fn entity(value: serde_json::Value) -> Entity {
        Entity::from_value(value).unwrap()
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = MembershipFilter::new(FilterConfig::new()).unwrap();
        assert!(!filter.matches(&entity(connection("c1", "e1", "e2"))));
        assert!(FilterConfig::new().is_empty());
    }

    #[test]
    fn target_matches_source_or_target() {
        let filter = MembershipFilter::new(FilterConfig::new().with_target("e2")).unwrap();
        assert_eq!(
            filter.match_reason(&entity(connection("c1", "e1", "e2"))),
            Some(MatchReason::Target)
        );
        assert!(filter.matches(&entity(connection("c2", "e2", "e9"))));
        assert!(!filter.matches(&entity(connection("c3", "e1", "e3"))));
    }

    #[test]
    fn claim_code_target_resolved_once() {
        let mut index = ClaimIndex::new(ChannelName::new("endpoints", "7"), "claimCode");
        let e = entity(endpoint("e5", "ABC123"));
        index.rebuild([&e], 1);

        let filter =
            MembershipFilter::with_index(FilterConfig::new().with_target("ABC123"), &index)
                .unwrap();
        assert_eq!(filter.target(), Some(&EntityId::from("e5")));

        // later index changes do not move the target
        index.rebuild(std::iter::empty(), 2);
        assert!(filter.matches(&entity(connection("c1", "e5", "e1"))));
    }

    #[test]
    fn source_name_substring_and_regex() {
        let conn = entity(detailed_connection(
            "c1",
            "e1",
            "e2",
            &["Studio A Cam 1", "Studio B Cam 2"],
        ));

        let substring =
            MembershipFilter::new(FilterConfig::new().with_source_pattern("Cam 2")).unwrap();
        assert_eq!(substring.match_reason(&conn), Some(MatchReason::SourceName));

        let regex = MembershipFilter::new(
            FilterConfig::new()
                .with_source_pattern(r"^Studio [AB] Cam \d$")
                .with_source_match(SourceMatch::Regex),
        )
        .unwrap();
        assert!(regex.matches(&conn));

        let named = entity(json!({"id": "c2", "sourceName": "Lobby"}));
        assert!(!substring.matches(&named));
    }

    #[test]
    fn invalid_regex_is_config_error() {
        let err = MembershipFilter::new(
            FilterConfig::new()
                .with_source_pattern("(unclosed")
                .with_source_match(SourceMatch::Regex),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn address_match_with_custom_field() {
        let conn = entity(json!({"id": "c1", "peer": {"ip": "10.0.0.5"}}));
        let filter = MembershipFilter::new(
            FilterConfig::new()
                .with_address("10.0.0.5")
                .with_address_field("peer.ip"),
        )
        .unwrap();
        assert_eq!(filter.match_reason(&conn), Some(MatchReason::Address));

        let default_fields =
            MembershipFilter::new(FilterConfig::new().with_address("10.0.0.5")).unwrap();
        assert!(!default_fields.matches(&conn));
        assert!(default_fields.matches(&entity(json!({"id": "c2", "address": "10.0.0.5"}))));
    }

    #[test]
    fn checks_run_in_order() {
        let filter = MembershipFilter::new(
            FilterConfig::new()
                .with_target("e1")
                .with_source_pattern("Cam")
                .with_predicate(|_| true),
        )
        .unwrap();

        let both = entity(json!({"id": "c1", "sourceId": "e1", "sourceName": "Cam"}));
        assert_eq!(filter.match_reason(&both), Some(MatchReason::Target));

        let named = entity(json!({"id": "c2", "sourceName": "Cam"}));
        assert_eq!(filter.match_reason(&named), Some(MatchReason::SourceName));

        let other = entity(json!({"id": "c3"}));
        assert_eq!(filter.match_reason(&other), Some(MatchReason::Predicate));
    }

    #[test]
    fn filter_is_deterministic() {
        let filter = MembershipFilter::new(
            FilterConfig::new()
                .with_target("e1")
                .with_source_pattern("Cam")
                .with_predicate(|e| e.get_str("state") == Some("active")),
        )
        .unwrap();

        let samples = [
            entity(connection("c1", "e1", "e2")),
            entity(json!({"id": "c2", "state": "active"})),
            entity(json!({"id": "c3", "state": "idle"})),
        ];
        let first: Vec<_> = samples.iter().map(|e| filter.matches(e)).collect();
        for _ in 0..10 {
            let again: Vec<_> = samples.iter().map(|e| filter.matches(e)).collect();
            assert_eq!(first, again);
        }
        assert_eq!(first, vec![true, true, false]);
    }
}
