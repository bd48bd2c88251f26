//! Schema-free entity records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of an entity within one channel.
///
/// Servers send ids as strings; integer ids are accepted and normalized to
/// their decimal form so both spellings address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Extracts an id from a JSON scalar.
    ///
    /// Returns `None` for empty strings and non-scalar values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_u64() || n.is_i64() => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A server-managed record mirrored by a replica.
///
/// The record keeps every field the server sent, including `id`. Nothing
/// beyond the identifier is interpreted by the replica itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    fields: Map<String, Value>,
}

impl Entity {
    /// Builds an entity from a decoded JSON value.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            other => Err(ProtocolError::NotAnObject(json_type(&other))),
        }
    }

    /// Builds an entity from a JSON object.
    pub fn from_fields(fields: Map<String, Value>) -> ProtocolResult<Self> {
        let id = fields
            .get("id")
            .and_then(EntityId::from_value)
            .ok_or(ProtocolError::MissingId)?;
        Ok(Self { id, fields })
    }

    /// Returns the entity id.
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Returns all fields, `id` included.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a top-level field when it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Resolves a dotted path such as `parameters.protocol`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Collects the strings stored at a dotted path.
    ///
    /// A string yields itself; an array yields its string elements. Any
    /// other shape yields nothing.
    pub fn strings_at(&self, path: &str) -> Vec<&str> {
        match self.get_path(path) {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Overwrites fields from a partial record, one by one.
    ///
    /// The `id` field is never replaced so the entity keeps its identity.
    /// Returns the names of the fields written, in patch order.
    pub fn merge(&mut self, patch: &Map<String, Value>) -> Vec<String> {
        let mut written = Vec::with_capacity(patch.len());
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
            written.push(key.clone());
        }
        written
    }

    /// Returns the entity as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Value> for Entity {
    type Error = ProtocolError;

    fn try_from(value: Value) -> ProtocolResult<Self> {
        Self::from_value(value)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
