//! Data channel naming.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::str::FromStr;

/// Name of a data channel: `/<entity-type>/<organization>`.
///
/// The organization segment is optional so that unscoped channels such as
/// `/connections` can be configured as well. Entity types are free-form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    entity_type: String,
    organization: Option<String>,
}

impl ChannelName {
    /// Creates a channel scoped to an organization.
    pub fn new(entity_type: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            organization: Some(organization.into()),
        }
    }

    /// Creates an unscoped channel.
    pub fn unscoped(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            organization: None,
        }
    }

    /// Parses a channel name such as `/endpoints/808410864692330497`.
    pub fn parse(name: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidChannel(name.to_string());
        let rest = name.strip_prefix('/').ok_or_else(invalid)?;

        let mut segments = rest.split('/');
        let entity_type = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let organization = match segments.next() {
            None => None,
            Some(org) if !org.is_empty() => Some(org.to_string()),
            Some(_) => return Err(invalid()),
        };
        if segments.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            entity_type: entity_type.to_string(),
            organization,
        })
    }

    /// Returns the entity type segment (e.g. `connections`).
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the organization segment, if any.
    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    /// Returns the key used to label the channel's replica
    /// (`connections_808410864692330497`).
    pub fn key(&self) -> String {
        match &self.organization {
            Some(org) => format!("{}_{}", self.entity_type, org),
            None => self.entity_type.clone(),
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.organization {
            Some(org) => write!(f, "/{}/{}", self.entity_type, org),
            None => write!(f, "/{}", self.entity_type),
        }
    }
}

impl FromStr for ChannelName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Self::parse(s)
    }
}
