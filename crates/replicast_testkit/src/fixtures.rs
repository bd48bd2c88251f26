//! Entity and message fixtures.
//!
//! Entities are plain JSON values so that tests can feed them through the
//! same decoding path as live traffic.

use serde_json::{json, Value};

/// A connection between two endpoints.
pub fn connection(id: &str, source_id: &str, target_id: &str) -> Value {
    json!({
        "id": id,
        "sourceId": source_id,
        "targetId": target_id,
        "state": "idle",
        "isStarted": false,
        "parameters": {
            "protocol": "NDI",
            "videoSources": []
        }
    })
}

/// A connection carrying the full field set the server sends, including an
/// error and named video sources.
pub fn detailed_connection(id: &str, source_id: &str, target_id: &str, sources: &[&str]) -> Value {
    json!({
        "id": id,
        "sourceId": source_id,
        "targetId": target_id,
        "state": "active",
        "isStarted": true,
        "parameters": {
            "protocol": "SRT",
            "videoSources": sources,
            "latency": 120
        },
        "error": null
    })
}

/// An endpoint registered under a claim code.
pub fn endpoint(id: &str, claim_code: &str) -> Value {
    json!({
        "id": id,
        "claimCode": claim_code,
        "name": format!("Endpoint {id}"),
        "online": true
    })
}

/// An `init` envelope.
pub fn init_msg(entities: Vec<Value>) -> Value {
    json!({"msg": "init", "data": entities})
}

/// An `add` envelope.
pub fn add_msg(entity: Value) -> Value {
    json!({"msg": "add", "data": entity})
}

/// An `update` envelope.
pub fn update_msg(id: &str, data: Value) -> Value {
    json!({"msg": "update", "data": {"id": id, "data": data}})
}

/// A `delete` envelope; the payload is an id or an object carrying one.
pub fn delete_msg(payload: Value) -> Value {
    json!({"msg": "delete", "data": payload})
}
