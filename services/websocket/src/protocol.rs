//! JSON frames exchanged with websocket clients.
//!
//! Requests: `{"for": <channel>, "data": {"event": "subscribe"|"unsubscribe",
//! "spec": ..., "id": "..."}}` (`data` is accepted in place of `spec`).
//! Responses: `{"type": "error"|"info"|"update"|"response", "for": <channel>,
//! "message"|"data": ..., "id": "..."}`.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "resource-update")]
    ResourceUpdate,
    #[serde(rename = "logs")]
    Logs,
    #[serde(rename = "jetstream-logs")]
    JetstreamLogs,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::ResourceUpdate => "resource-update",
            Channel::Logs => "logs",
            Channel::JetstreamLogs => "jetstream-logs",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "for")]
    pub channel: Channel,
    pub data: RequestData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestData {
    pub event: Event,
    #[serde(alias = "data", default)]
    pub spec: Value,
    #[serde(default)]
    pub id: String,
}

impl ClientRequest {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Spec of a `logs` or `jetstream-logs` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    pub account: String,
    pub cluster: String,
    pub tracking_id: String,
    /// Replay window, `jetstream-logs` only.
    #[serde(default)]
    pub since: Option<String>,
    /// Client-chosen prefix for the replay consumer name.
    #[serde(default)]
    pub consumer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Error,
    Info,
    Update,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub id: String,
}

impl ServerFrame {
    pub fn error(channel: Option<Channel>, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_message(FrameType::Error, channel, id, message)
    }

    pub fn info(channel: Channel, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_message(FrameType::Info, Some(channel), id, message)
    }

    pub fn response(channel: Channel, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_message(FrameType::Response, Some(channel), id, message)
    }

    pub fn update(channel: Channel, id: impl Into<String>, data: Value) -> Self {
        Self {
            frame_type: FrameType::Update,
            channel: Some(channel),
            message: None,
            data: Some(data),
            id: id.into(),
        }
    }

    fn with_message(
        frame_type: FrameType,
        channel: Option<Channel>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            frame_type,
            channel,
            message: Some(message.into()),
            data: None,
            id: id.into(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Update frame payload: JSON bodies pass through, anything else is sent as text.
pub fn payload_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_request_accepts_spec_or_data() {
        let with_spec = ClientRequest::parse(
            r#"{"for":"resource-update","data":{"event":"subscribe","spec":"account:acme","id":"1"}}"#,
        )
        .expect("spec");
        let with_data = ClientRequest::parse(
            r#"{"for":"resource-update","data":{"event":"subscribe","data":"account:acme","id":"1"}}"#,
        )
        .expect("data");
        assert_eq!(with_spec, with_data);
        assert_eq!(with_spec.channel, Channel::ResourceUpdate);
        assert_eq!(with_spec.data.event, Event::Subscribe);
        assert_eq!(with_spec.data.spec, json!("account:acme"));
    }

    #[test]
    fn log_spec_uses_camel_case() {
        let request = ClientRequest::parse(
            r#"{"for":"jetstream-logs","data":{"event":"subscribe","id":"7","spec":{"account":"acme","cluster":"c1","trackingId":"t-1","since":"1h","consumerId":"ui"}}}"#,
        )
        .expect("request");
        let spec: LogSpec = serde_json::from_value(request.data.spec).expect("spec");
        assert_eq!(spec.tracking_id, "t-1");
        assert_eq!(spec.since.as_deref(), Some("1h"));
        assert_eq!(spec.consumer_id.as_deref(), Some("ui"));
    }

    #[test]
    fn unknown_channel_is_rejected() {
        assert!(
            ClientRequest::parse(r#"{"for":"metrics","data":{"event":"subscribe","id":"1"}}"#)
                .is_err()
        );
    }

    #[test]
    fn frames_serialize_with_protocol_field_names() {
        let frame = ServerFrame::error(Some(Channel::Logs), "3", "denied");
        let value: Value = serde_json::from_str(&frame.to_text().expect("json")).expect("value");
        assert_eq!(
            value,
            json!({"type": "error", "for": "logs", "message": "denied", "id": "3"})
        );

        let update = ServerFrame::update(Channel::ResourceUpdate, "4", json!({"kind": "App"}));
        let value: Value = serde_json::from_str(&update.to_text().expect("json")).expect("value");
        assert_eq!(
            value,
            json!({"type": "update", "for": "resource-update", "data": {"kind": "App"}, "id": "4"})
        );
    }

    #[test]
    fn non_json_payload_becomes_text() {
        assert_eq!(payload_value(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(payload_value(b"plain line"), json!("plain line"));
    }
}
