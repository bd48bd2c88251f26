//! Data channel messages.
//!
//! Every message published on a data channel is an envelope of the form
//! `{ "msg": <kind>, "data": <payload> }`. Decoding is defensive: a missing
//! kind or a payload of the wrong shape produces a [`ProtocolError`] and
//! never panics. Unknown kinds decode successfully into
//! [`ChannelMessage::Unrecognized`] so the caller decides what to do.

use crate::entity::{json_type, Entity, EntityId};
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// The recognized message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Full snapshot of the collection.
    Init,
    /// One entity was created (or re-delivered).
    Add,
    /// Some fields of one entity changed.
    Update,
    /// One entity was removed.
    Delete,
}

impl MessageKind {
    /// Parses the `msg` field.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "init" => Some(Self::Init),
            "add" => Some(Self::Add),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A decoded data channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Replace the whole collection.
    Init(Vec<Entity>),
    /// Insert or replace one entity.
    Add(Entity),
    /// Merge fields into an existing entity.
    Update {
        /// Target entity.
        id: EntityId,
        /// Fields to overwrite.
        data: Map<String, Value>,
    },
    /// Remove one entity.
    Delete(EntityId),
    /// A kind this client does not understand.
    Unrecognized {
        /// The `msg` value.
        kind: String,
        /// The raw payload.
        payload: Value,
    },
}

impl ChannelMessage {
    /// Decodes a message envelope.
    pub fn decode(raw: &Value) -> ProtocolResult<Self> {
        let envelope = raw.as_object().ok_or(ProtocolError::MissingKind)?;
        let kind = envelope
            .get("msg")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or(ProtocolError::MissingKind)?;
        let payload = envelope.get("data").unwrap_or(&Value::Null);

        match MessageKind::parse(kind) {
            Some(MessageKind::Init) => decode_init(payload),
            Some(MessageKind::Add) => decode_add(payload),
            Some(MessageKind::Update) => decode_update(payload),
            Some(MessageKind::Delete) => decode_delete(payload),
            None => Ok(Self::Unrecognized {
                kind: kind.to_string(),
                payload: payload.clone(),
            }),
        }
    }

    /// Decodes a message envelope from JSON text.
    pub fn decode_str(text: &str) -> ProtocolResult<Self> {
        let raw: Value = serde_json::from_str(text)?;
        Self::decode(&raw)
    }

    /// Returns the recognized kind, or `None` for unrecognized messages.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::Init(_) => Some(MessageKind::Init),
            Self::Add(_) => Some(MessageKind::Add),
            Self::Update { .. } => Some(MessageKind::Update),
            Self::Delete(_) => Some(MessageKind::Delete),
            Self::Unrecognized { .. } => None,
        }
    }

    /// Returns the wire name of the message kind.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Unrecognized { kind, .. } => kind.as_str(),
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }
}

fn decode_init(payload: &Value) -> ProtocolResult<ChannelMessage> {
    let items = payload.as_array().ok_or_else(|| {
        ProtocolError::invalid_payload("init", format!("expected array, got {}", json_type(payload)))
    })?;

    let entities = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            Entity::from_value(item.clone()).map_err(|e| {
                ProtocolError::invalid_payload("init", format!("element {index}: {e}"))
            })
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok(ChannelMessage::Init(entities))
}

fn decode_add(payload: &Value) -> ProtocolResult<ChannelMessage> {
    Entity::from_value(payload.clone())
        .map(ChannelMessage::Add)
        .map_err(|e| ProtocolError::invalid_payload("add", e.to_string()))
}

fn decode_update(payload: &Value) -> ProtocolResult<ChannelMessage> {
    let object = payload.as_object().ok_or_else(|| {
        ProtocolError::invalid_payload("update", format!("expected object, got {}", json_type(payload)))
    })?;
    let id = object
        .get("id")
        .and_then(EntityId::from_value)
        .ok_or_else(|| ProtocolError::invalid_payload("update", "missing `id`"))?;
    let data = object
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::invalid_payload("update", "missing `data` object"))?;

    Ok(ChannelMessage::Update {
        id,
        data: data.clone(),
    })
}

fn decode_delete(payload: &Value) -> ProtocolResult<ChannelMessage> {
    let id = match payload {
        Value::Object(object) => object.get("id").and_then(EntityId::from_value),
        scalar => EntityId::from_value(scalar),
    };
    id.map(ChannelMessage::Delete)
        .ok_or_else(|| ProtocolError::invalid_payload("delete", "missing `id`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_init() {
        let msg = ChannelMessage::decode(&json!({
            "msg": "init",
            "data": [{"id": "a"}, {"id": "b", "state": "idle"}]
        }))
        .unwrap();

        match msg {
            ChannelMessage::Init(entities) => {
                let ids: Vec<_> = entities.iter().map(|e| e.id().as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn init_rejects_entities_without_id() {
        let err = ChannelMessage::decode(&json!({
            "msg": "init",
            "data": [{"id": "a"}, {"state": "orphan"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "init"));
    }

    #[test]
    fn init_requires_array() {
        let err = ChannelMessage::decode(&json!({"msg": "init", "data": {"id": "a"}})).unwrap_err();
        assert!(err.to_string().contains("expected array, got object"));
    }

    #[test]
    fn decode_add_and_update() {
        let add = ChannelMessage::decode(&json!({"msg": "add", "data": {"id": "c1"}})).unwrap();
        assert_eq!(add.kind(), Some(MessageKind::Add));

        let update = ChannelMessage::decode(&json!({
            "msg": "update",
            "data": {"id": "c1", "data": {"state": "live"}}
        }))
        .unwrap();
        match update {
            ChannelMessage::Update { id, data } => {
                assert_eq!(id.as_str(), "c1");
                assert_eq!(data.get("state"), Some(&json!("live")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn update_requires_id_and_data() {
        assert!(ChannelMessage::decode(&json!({"msg": "update", "data": {"data": {}}})).is_err());
        assert!(ChannelMessage::decode(&json!({"msg": "update", "data": {"id": "c1"}})).is_err());
        assert!(ChannelMessage::decode(&json!({"msg": "update", "data": "c1"})).is_err());
    }

    #[test]
    fn delete_accepts_id_or_entity() {
        let by_id = ChannelMessage::decode(&json!({"msg": "delete", "data": "c1"})).unwrap();
        let by_num = ChannelMessage::decode(&json!({"msg": "delete", "data": 17})).unwrap();
        let by_entity =
            ChannelMessage::decode(&json!({"msg": "delete", "data": {"id": "c1", "state": "x"}}))
                .unwrap();

        assert_eq!(by_id, ChannelMessage::Delete(EntityId::from("c1")));
        assert_eq!(by_num, ChannelMessage::Delete(EntityId::from("17")));
        assert_eq!(by_entity, by_id);
        assert!(ChannelMessage::decode(&json!({"msg": "delete"})).is_err());
    }

    #[test]
    fn missing_kind_is_malformed() {
        for raw in [
            json!({"data": []}),
            json!({"msg": 3, "data": []}),
            json!({"msg": "", "data": []}),
            json!(null),
            json!("init"),
        ] {
            assert_eq!(ChannelMessage::decode(&raw), Err(ProtocolError::MissingKind));
        }
    }

    #[test]
    fn unknown_kind_is_unrecognized() {
        let msg = ChannelMessage::decode(&json!({"msg": "snapshot", "data": [1, 2]})).unwrap();
        assert_eq!(msg.kind(), None);
        assert_eq!(msg.kind_name(), "snapshot");
        assert_eq!(
            msg,
            ChannelMessage::Unrecognized {
                kind: "snapshot".into(),
                payload: json!([1, 2]),
            }
        );
    }

    #[test]
    fn extra_fields_are_ignored() {
        let msg = ChannelMessage::decode_str(
            r#"{"msg":"add","data":{"id":"c9"},"seq":12,"channel":"/connections/1"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind_name(), "add");
    }

    #[test]
    fn invalid_json_text() {
        assert!(matches!(
            ChannelMessage::decode_str("{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    fn arb_json() -> impl proptest::strategy::Strategy<Value = Value> {
        use proptest::prelude::*;
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
            prop::sample::select(vec!["init", "add", "update", "delete", "id", "msg", "data"])
                .prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map(
                    prop::sample::select(vec!["msg", "data", "id", "state"]).prop_map(String::from),
                    inner,
                    0..4,
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest::proptest! {
        #[test]
        fn decode_never_panics(raw in arb_json()) {
            let _ = ChannelMessage::decode(&raw);
        }

        #[test]
        fn decode_str_never_panics(text in ".{0,64}") {
            let _ = ChannelMessage::decode_str(&text);
        }
    }
}
