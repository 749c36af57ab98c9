use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ROOM_UPDATE: &str = "room_update";
pub const RANKING_UPDATE: &str = "ranking_update";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl WsEnvelope {
    /// Server-pushed event stamped with the current time.
    pub fn push(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
            request_id: None,
            ts: Some(Utc::now().to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushed_events_omit_request_id() {
        let env = WsEnvelope::push(RANKING_UPDATE, serde_json::json!([{"percentage": 90}]));
        let raw = serde_json::to_value(&env).unwrap();
        assert_eq!(raw["event"], "ranking_update");
        assert!(raw.get("request_id").is_none());
        assert!(raw["ts"].is_string());

        let parsed: WsEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.payload[0]["percentage"], 90);
    }

    #[test]
    fn deleted_room_is_a_null_payload() {
        let raw = serde_json::to_string(&WsEnvelope::push(ROOM_UPDATE, Value::Null)).unwrap();
        assert!(raw.contains("\"payload\":null"));
    }
}
