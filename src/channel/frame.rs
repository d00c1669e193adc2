//! Engine.IO v4 / Socket.IO v5 text frame codec.
//!
//! Only the text encoding over the websocket transport is supported. Binary
//! attachments are rejected.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown engine packet type {0:?}")]
    UnknownEnginePacket(char),

    #[error("Unknown socket packet type {0:?}")]
    UnknownSocketPacket(char),

    #[error("Binary attachments are not supported")]
    Binary,

    #[error("Invalid JSON in frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed event: {0}")]
    InvalidEvent(String),
}

/// Payload of the engine `open` packet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenHandshake {
    /// Longest silence tolerated before the transport counts as dead.
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO packet carried by an engine `message`. Namespaces other than
/// the default one are parsed but not tracked.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Value),
    Disconnect,
    Event {
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    Ack {
        ack_id: u64,
        payload: Value,
    },
    ConnectError(Value),
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(FrameError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(rest.to_string())),
            '3' => Ok(Self::Pong(rest.to_string())),
            '4' => Ok(Self::Message(SocketPacket::decode(rest)?)),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(FrameError::UnknownEnginePacket(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // Clients never send `open`; encoded for completeness.
            Self::Open(handshake) => format!("0{{\"sid\":{}}}", Value::from(handshake.sid.as_str())),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data),
            Self::Pong(data) => format!("3{}", data),
            Self::Message(packet) => format!("4{}", packet.encode()),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

impl SocketPacket {
    /// Client event packet `2["name",payload]`.
    pub fn event(name: &str, payload: Value) -> Self {
        Self::Event {
            ack_id: None,
            name: name.to_string(),
            payload,
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(FrameError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(FrameError::Binary);
        }

        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let ack_id = if digits > 0 {
            rest[..digits].parse::<u64>().ok()
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(rest)?
        };

        match kind {
            '0' => Ok(Self::Connect(data)),
            '1' => Ok(Self::Disconnect),
            '2' => {
                let (name, payload) = split_event(data)?;
                Ok(Self::Event {
                    ack_id,
                    name,
                    payload,
                })
            }
            '3' => {
                let ack_id =
                    ack_id.ok_or_else(|| FrameError::InvalidEvent("ack without id".to_string()))?;
                let payload = match data {
                    Value::Array(mut args) if args.len() == 1 => args.remove(0),
                    other => other,
                };
                Ok(Self::Ack { ack_id, payload })
            }
            '4' => Ok(Self::ConnectError(data)),
            other => Err(FrameError::UnknownSocketPacket(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(Value::Null) => "0".to_string(),
            Self::Connect(auth) => format!("0{}", auth),
            Self::Disconnect => "1".to_string(),
            Self::Event {
                ack_id,
                name,
                payload,
            } => {
                let args = if payload.is_null() {
                    Value::Array(vec![Value::from(name.as_str())])
                } else {
                    Value::Array(vec![Value::from(name.as_str()), payload.clone()])
                };
                match ack_id {
                    Some(id) => format!("2{}{}", id, args),
                    None => format!("2{}", args),
                }
            }
            Self::Ack { ack_id, payload } => {
                format!("3{}{}", ack_id, Value::Array(vec![payload.clone()]))
            }
            Self::ConnectError(data) => format!("4{}", data),
        }
    }
}

/// `["name", payload, ...]` into name and first argument.
fn split_event(data: Value) -> Result<(String, Value), FrameError> {
    let mut args = match data {
        Value::Array(args) => args.into_iter(),
        other => {
            return Err(FrameError::InvalidEvent(format!(
                "expected array, got {}",
                other
            )))
        }
    };
    let name = match args.next() {
        Some(Value::String(name)) => name,
        _ => return Err(FrameError::InvalidEvent("missing event name".to_string())),
    };
    Ok((name, args.next().unwrap_or(Value::Null)))
}
