//! # Protocol Codec
//!
//! The two framings the relay speaks.
//!
//! ## JSON Framing (discrete turn, `/pipeline`):
//! Every message is `{"type": ..., "value": ...}`.
//! - **client → server**: `wav` (base64 audio), `history` (list of
//!   `{"role", "content"}`), `end` (no value)
//! - **server → client**: one `transcript`, then a `text` / `wav` pair per sentence
//!
//! ## Tagged Binary Framing (duplex session, `/ws`):
//! - **client → server**: raw codec bytes, no prefix
//! - **server → client**: one tag byte, then the payload: `0x01` audio, `0x02` UTF-8 text
//!
//! Unknown `type` values are reported as [`ProtocolError::UnknownType`] so callers can
//! log and skip them; everything else that fails to decode is malformed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::pipeline::history::HistoryEntry;

pub const AUDIO_TAG: u8 = 0x01;
pub const TEXT_TAG: u8 = 0x02;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("message type {0} requires a value")]
    MissingValue(&'static str),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
}

/// What a client can send during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Wav(Vec<u8>),
    History(Vec<HistoryEntry>),
    End,
}

/// What the server sends during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Transcript(String),
    Text(String),
    Wav(Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl WireMessage {
    fn new(kind: &str, value: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            value,
        }
    }

    fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn to_json(&self) -> String {
        // A struct of a string and a JSON value always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn string_value(&self, kind: &'static str) -> Result<String, ProtocolError> {
        match &self.value {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(_) => Err(ProtocolError::Malformed(format!("{} value must be a string", kind))),
            None => Err(ProtocolError::MissingValue(kind)),
        }
    }

    fn base64_value(&self, kind: &'static str) -> Result<Vec<u8>, ProtocolError> {
        let encoded = self.string_value(kind)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))
    }
}

/// Encoder/decoder for both framings.
pub struct ProtocolCodec;

impl ProtocolCodec {
    /// Decode a client turn message from a text or binary frame payload.
    pub fn decode_client(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let message = WireMessage::parse(payload)?;
        match message.kind.as_str() {
            "wav" => Ok(ClientMessage::Wav(message.base64_value("wav")?)),
            "history" => {
                let value = message.value.ok_or(ProtocolError::MissingValue("history"))?;
                let entries: Vec<HistoryEntry> = serde_json::from_value(value)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(ClientMessage::History(entries))
            }
            "end" => Ok(ClientMessage::End),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn encode_client(message: &ClientMessage) -> String {
        let wire = match message {
            ClientMessage::Wav(audio) => {
                WireMessage::new("wav", Some(Value::String(BASE64.encode(audio))))
            }
            ClientMessage::History(entries) => WireMessage::new(
                "history",
                Some(serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new()))),
            ),
            ClientMessage::End => WireMessage::new("end", None),
        };
        wire.to_json()
    }

    pub fn encode_server(message: &ServerMessage) -> String {
        let wire = match message {
            ServerMessage::Transcript(text) => {
                WireMessage::new("transcript", Some(Value::String(text.clone())))
            }
            ServerMessage::Text(text) => WireMessage::new("text", Some(Value::String(text.clone()))),
            ServerMessage::Wav(audio) => {
                WireMessage::new("wav", Some(Value::String(BASE64.encode(audio))))
            }
        };
        wire.to_json()
    }

    pub fn decode_server(payload: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let message = WireMessage::parse(payload)?;
        match message.kind.as_str() {
            "transcript" => Ok(ServerMessage::Transcript(message.string_value("transcript")?)),
            "text" => Ok(ServerMessage::Text(message.string_value("text")?)),
            "wav" => Ok(ServerMessage::Wav(message.base64_value("wav")?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// One duplex output frame: a tag byte plus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedMessage {
    Audio(Vec<u8>),
    Text(String),
}

impl TaggedMessage {
    pub fn tag(&self) -> u8 {
        match self {
            TaggedMessage::Audio(_) => AUDIO_TAG,
            TaggedMessage::Text(_) => TEXT_TAG,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = match self {
            TaggedMessage::Audio(bytes) => bytes,
            TaggedMessage::Text(text) => text.as_bytes(),
        };
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(self.tag());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match tag {
            AUDIO_TAG => Ok(TaggedMessage::Audio(payload.to_vec())),
            TEXT_TAG => std::str::from_utf8(payload)
                .map(|text| TaggedMessage::Text(text.to_string()))
                .map_err(|_| ProtocolError::InvalidUtf8),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}
