use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of every successful count response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Body of an increment or decrement request. A missing value means 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

impl AdjustRequest {
    pub fn by(value: u64) -> Self {
        Self { value: Some(value) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    CountChanged { count: u64, at: DateTime<Utc> },
}

impl ServerEvent {
    pub fn count_changed(count: u64) -> Self {
        ServerEvent::CountChanged {
            count,
            at: Utc::now(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            ServerEvent::CountChanged { count, .. } => *count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_request_omits_missing_value() {
        let body = serde_json::to_value(AdjustRequest::default()).expect("json");
        assert_eq!(body, serde_json::json!({}));
        let body = serde_json::to_value(AdjustRequest::by(5)).expect("json");
        assert_eq!(body, serde_json::json!({ "value": 5 }));
    }

    #[test]
    fn server_event_uses_tagged_layout() {
        let event = ServerEvent::count_changed(7);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "count_changed");
        assert_eq!(json["payload"]["count"], 7);
    }
}
