//! Messages carried by the transport between agents.

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Receiver id that addresses every subscribed agent.
pub const BROADCAST_TARGET: &str = "*";

/// Kind of payload a [`Message`] carries; transports filter on it per
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    Result,
    Progress,
    Heartbeat,
    Control,
    Broadcast,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::Task,
        MessageType::Result,
        MessageType::Progress,
        MessageType::Heartbeat,
        MessageType::Control,
        MessageType::Broadcast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Task => "task",
            MessageType::Result => "result",
            MessageType::Progress => "progress",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Control => "control",
            MessageType::Broadcast => "broadcast",
        }
    }
}

/// Trace propagation context forwarded with every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// Envelope produced by a sender and consumed at most once per receiver
/// subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// Agent id, or [`BROADCAST_TARGET`] for fan-out.
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload bytes; task/result messages carry JSON documents.
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    pub created_at: SystemTime,
    /// Partition/ordering key for partitioned-log backends. Conversations
    /// needing mutual ordering must share a key; defaults to the message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub trace: TraceContext,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            message_type,
            payload,
            created_at: SystemTime::now(),
            key: None,
            trace: TraceContext::default(),
        }
    }

    /// Build a message whose payload is the JSON encoding of `body`.
    pub fn with_json<T: Serialize>(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        body: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(from, to, message_type, payload))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_TARGET
    }

    /// Ordering key for partitioned backends.
    pub fn partition_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.id)
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            Error::new(ErrorKind::InvalidInput, format!("malformed message payload: {e}"))
        })
    }

    /// Serialize for the wire (byte-stable JSON document).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("malformed message: {e}")))
    }

    /// Frame with a u32 big-endian length prefix, the partitioned-log wire
    /// format.
    pub fn encode_framed(&self) -> Result<Vec<u8>> {
        let body = self.encode()?;
        if body.len() > u32::MAX as usize {
            return Err(Error::payload_too_large("message exceeds u32 frame length"));
        }
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    pub fn decode_framed(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::invalid_input("frame shorter than length prefix"));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = &bytes[4..];
        if body.len() != len {
            return Err(Error::invalid_input(format!(
                "frame length mismatch: prefix {len}, body {}",
                body.len()
            )));
        }
        Self::decode(body)
    }
}

/// Payload of a `MessageType::Result` message: one task's outcome, sent from
/// the executing worker back to the submitting coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: String,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::task::TaskFailure>,
    pub attempts: u32,
}

impl TaskResultPayload {
    pub fn success(task_id: impl Into<String>, worker_id: impl Into<String>, result: serde_json::Value, attempts: u32) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            result: Some(result),
            error: None,
            attempts,
        }
    }

    pub fn failure(task_id: impl Into<String>, worker_id: impl Into<String>, failure: crate::task::TaskFailure) -> Self {
        let attempts = failure.attempts;
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            result: None,
            error: Some(failure),
            attempts,
        }
    }
}

/// Control verbs carried in `MessageType::Control` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop executing `task_id` if it is still in flight.
    Cancel { task_id: String },
    /// Finish the current task, then stop accepting new ones.
    Drain,
    /// Orderly worker shutdown.
    Shutdown,
}

mod payload_b64 {
    //! Payload bytes encoded as base64 strings; raw bytes are not valid JSON
    //! and arrays of numbers bloat the wire format.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_is_lossless() {
        let msg = Message::with_json("coordinator", "worker-1", MessageType::Task, &json!({
            "id": "t1",
            "input": {"msg": "hi"}
        }))
        .unwrap()
        .with_key("t1");

        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn framed_round_trip_is_lossless() {
        let msg = Message::new("a", "b", MessageType::Heartbeat, vec![0, 1, 2, 250, 255]);
        let framed = msg.encode_framed().unwrap();
        assert_eq!(
            u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize,
            framed.len() - 4
        );
        let decoded = Message::decode_framed(&framed).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn frame_length_mismatch_is_rejected() {
        let msg = Message::new("a", "b", MessageType::Control, vec![1, 2, 3]);
        let mut framed = msg.encode_framed().unwrap();
        framed.truncate(framed.len() - 1);
        let err = Message::decode_framed(&framed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn partition_key_defaults_to_message_id() {
        let msg = Message::new("a", "b", MessageType::Task, vec![]);
        assert_eq!(msg.partition_key(), msg.id);
        let msg = msg.with_key("conversation-7");
        assert_eq!(msg.partition_key(), "conversation-7");
    }

    #[test]
    fn broadcast_target_is_detected() {
        let msg = Message::new("a", BROADCAST_TARGET, MessageType::Broadcast, vec![]);
        assert!(msg.is_broadcast());
    }

    #[test]
    fn control_commands_round_trip() {
        let cancel = ControlCommand::Cancel { task_id: "t9".to_string() };
        let msg =
            Message::with_json("coordinator", "worker-1", MessageType::Control, &cancel).unwrap();
        let decoded: ControlCommand = msg.decode_json().unwrap();
        assert_eq!(decoded, cancel);
    }

    #[test]
    fn payload_survives_json_at_all_lengths() {
        for len in 0..16usize {
            let payload: Vec<u8> = (0..len as u8).collect();
            let msg = Message::new("a", "b", MessageType::Task, payload.clone());
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.payload, payload);
        }
    }
}
