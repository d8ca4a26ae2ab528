//! JSON-RPC 2.0 frame construction and classification.
//!
//! Kept free of socket state so framing is testable without a firmware.

use serde_json::{json, Value};

/// Build a `printer.gcode.script` request.
pub fn gcode_request(script: &str, id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "printer.gcode.script",
        "params": { "script": script },
        "id": id,
    })
    .to_string()
}

/// Build a `printer.objects.subscribe` request for the named objects.
pub fn subscribe_request(objects: &[&str], id: u64) -> String {
    let mut map = serde_json::Map::new();
    for name in objects {
        map.insert((*name).to_string(), Value::Null);
    }
    json!({
        "jsonrpc": "2.0",
        "method": "printer.objects.subscribe",
        "params": { "objects": Value::Object(map) },
        "id": id,
    })
    .to_string()
}

/// Build a `printer.objects.query` request for a single object.
pub fn query_request(object: &str, id: u64) -> String {
    let mut map = serde_json::Map::new();
    map.insert(object.to_string(), Value::Null);
    json!({
        "jsonrpc": "2.0",
        "method": "printer.objects.query",
        "params": { "objects": Value::Object(map) },
        "id": id,
    })
    .to_string()
}

/// Build a `printer.info` liveness request.
pub fn info_request(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "printer.info",
        "id": id,
    })
    .to_string()
}

/// Classified inbound frame.
#[derive(Debug)]
pub enum Inbound {
    /// First params element of a `notify_status_update` notification.
    StatusUpdate(Value),
    KlippyShutdown,
    KlippyReady,
    /// Response frame carrying `result` (or `error`) for a request id.
    Response { id: u64, result: Value },
    /// Anything else (unknown notifications, malformed frames).
    Other,
}

/// Classify one inbound text frame.
pub fn classify(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Other,
    };

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        return match method {
            "notify_status_update" => {
                match value.get("params").and_then(Value::as_array).and_then(|p| p.first()) {
                    Some(first) => Inbound::StatusUpdate(first.clone()),
                    None => Inbound::Other,
                }
            }
            "notify_klippy_shutdown" => Inbound::KlippyShutdown,
            "notify_klippy_ready" => Inbound::KlippyReady,
            _ => Inbound::Other,
        };
    }

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let result = value
            .get("result")
            .cloned()
            .or_else(|| value.get("error").cloned())
            .unwrap_or(Value::Null);
        return Inbound::Response { id, result };
    }

    Inbound::Other
}

/// Extract `result.state` from a `printer.info` response payload.
pub fn info_state(result: &Value) -> Option<&str> {
    result.get("state").and_then(Value::as_str)
}
