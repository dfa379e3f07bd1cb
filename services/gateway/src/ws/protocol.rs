//! Defines the MessagePack protocol between WebSocket clients and the gateway.
//!
//! Clients send an [`Envelope`] as a binary frame. The gateway answers with a
//! [`Frame`] whose `payload` is a [`Response`] carrying either `data` (success)
//! or `message` (error).

use crate::error::GatewayError;
use bytes::Bytes;
use rmpv::Value;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Event and subevent names used on the wire.
pub mod events {
    pub const CONNECTED: &str = "connected";

    pub const TRANSCRIPTION: &str = "TRANSCRIPTION";
    pub const STREAM_INIT: &str = "transcription:stream:init";
    pub const STREAM_BINARY: &str = "transcription:stream:binary";
    pub const STREAM_CLOSE: &str = "transcription:stream:close";
    pub const STREAM_INITIATED: &str = "transcription:stream:initiated";
    pub const STREAM_CLOSED: &str = "transcription:stream:closed";
    pub const STREAM_PAUSE: &str = "transcription:stream:pause";
    pub const STREAM_RESUME: &str = "transcription:stream:resume";
    pub const STREAM_RETRY: &str = "transcription:stream:retry";
    pub const STREAM_FAILED: &str = "transcription:stream:failed";
    pub const STREAM_RECOGNIZING: &str = "transcription:stream:recognizing";
    pub const STREAM_RECOGNIZED: &str = "transcription:stream:recognized";
    pub const STREAM_ERROR: &str = "transcription:stream:error";
    pub const STREAM_CANCELLED: &str = "transcription:stream:cancelled";

    pub const CONVERSATION: &str = "CONVERSATION";
    pub const CONVERSATION_START: &str = "conversation:start";
    pub const CONVERSATION_CONTINUE: &str = "conversation:continue";
    pub const CONVERSATION_END: &str = "conversation:end";
    pub const CONVERSATION_STARTED: &str = "conversation:started";
    pub const CONVERSATION_CONTINUED: &str = "conversation:continued";
    pub const CONVERSATION_ENDED: &str = "conversation:ended";
}

fn nil() -> Value {
    Value::Nil
}

/// A message sent from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subevent: Option<String>,
    /// Either a structured object or raw bytes, depending on the subevent.
    #[serde(default = "nil")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, subevent: Option<&str>, payload: Value) -> Self {
        Self {
            event: event.into(),
            subevent: subevent.map(str::to_owned),
            payload,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GatewayError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, GatewayError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes a structured payload into `T`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        let bytes = rmp_serde::to_vec(&self.payload)?;
        rmp_serde::from_slice(&bytes).map_err(|e| GatewayError::InvalidPayload(e.to_string()))
    }

    /// Takes the payload as raw bytes. Anything else is rejected.
    pub fn into_binary(self) -> Result<Bytes, GatewayError> {
        match self.payload {
            Value::Binary(data) => Ok(Bytes::from(data)),
            _ => Err(GatewayError::InvalidPayload(
                "Payload is not a byte buffer".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// The body of every frame the gateway sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A message sent from the gateway to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub payload: Response,
}

impl Frame {
    pub fn success(kind: &str, data: serde_json::Value) -> Self {
        Self {
            event: kind.to_string(),
            payload: Response {
                kind: kind.to_string(),
                status: Status::Success,
                data: Some(data),
                message: None,
            },
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            event: kind.to_string(),
            payload: Response {
                kind: kind.to_string(),
                status: Status::Error,
                data: None,
                message: Some(message.into()),
            },
        }
    }

    /// Error frame for a gateway-level failure, typed by the error's kind.
    pub fn from_error(err: &GatewayError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn encode(&self) -> Result<Vec<u8>, GatewayError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GatewayError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn is_error(&self) -> bool {
        self.payload.status == Status::Error
    }
}
