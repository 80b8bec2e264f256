//! Wire protocol spoken between the daemon and its monitoring drivers.
//!
//! Every datagram carries exactly one message, a single text line:
//!
//! ```text
//! TYPE HOST_ID TIMESTAMP B64_PAYLOAD
//! ```
//!
//! The payload is opaque template text until the dispatcher decodes it; `-`
//! stands for an empty payload. Messages are size-bounded by configuration;
//! anything larger is rejected before decryption.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

/// Default upper bound for one encoded message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Driver handshake when it comes up.
    Init,
    /// Driver teardown.
    Finalize,
    /// Full host sample (request from daemon, reply from driver).
    MonitorHost,
    /// VM sample relayed by a host probe.
    MonitorVm,
    /// Liveness-only message, no sample payload.
    BeaconHost,
    /// System-facts-only sample.
    SystemHost,
    /// Tell a driver to start monitoring a host.
    StartMonitor,
    /// Tell a driver to stop monitoring a host.
    StopMonitor,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Init => "INIT",
            MessageType::Finalize => "FINALIZE",
            MessageType::MonitorHost => "MONITOR_HOST",
            MessageType::MonitorVm => "MONITOR_VM",
            MessageType::BeaconHost => "BEACON_HOST",
            MessageType::SystemHost => "SYSTEM_HOST",
            MessageType::StartMonitor => "START_MONITOR",
            MessageType::StopMonitor => "STOP_MONITOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INIT" => Some(MessageType::Init),
            "FINALIZE" => Some(MessageType::Finalize),
            "MONITOR_HOST" => Some(MessageType::MonitorHost),
            "MONITOR_VM" => Some(MessageType::MonitorVm),
            "BEACON_HOST" => Some(MessageType::BeaconHost),
            "SYSTEM_HOST" => Some(MessageType::SystemHost),
            "START_MONITOR" => Some(MessageType::StartMonitor),
            "STOP_MONITOR" => Some(MessageType::StopMonitor),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised on the transport/decode path. These never reach the manager
/// as data; the offending message is dropped and counted.
#[derive(Debug)]
pub enum ProtocolError {
    /// The line did not match the envelope format.
    MalformedMessage(String),

    /// Encoded message exceeds the configured bound.
    MessageTooLarge { size: usize, limit: usize },

    /// Inbound message failed decryption or its integrity check.
    DecryptionFailure,

    /// Recognized envelope, unknown type token.
    UnknownMessageType(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedMessage(msg) => write!(f, "malformed message: {msg}"),
            ProtocolError::MessageTooLarge { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit}")
            }
            ProtocolError::DecryptionFailure => write!(f, "message failed decryption"),
            ProtocolError::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub host_id: i64,
    /// Sample collection time (unix seconds), set by the sender.
    pub timestamp: i64,
    /// Opaque template text; empty for beacons and control messages.
    pub payload: String,
}

impl Message {
    pub fn new(msg_type: MessageType, host_id: i64, timestamp: i64, payload: String) -> Self {
        Self {
            msg_type,
            host_id,
            timestamp,
            payload,
        }
    }

    /// Encode to the single-line wire form, enforcing the size bound.
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>, ProtocolError> {
        let payload = if self.payload.is_empty() {
            "-".to_string()
        } else {
            B64.encode(self.payload.as_bytes())
        };

        let line = format!(
            "{} {} {} {}\n",
            self.msg_type, self.host_id, self.timestamp, payload
        );

        if line.len() > limit {
            return Err(ProtocolError::MessageTooLarge {
                size: line.len(),
                limit,
            });
        }

        Ok(line.into_bytes())
    }

    /// Decode from raw bytes, enforcing the size bound first.
    pub fn decode(raw: &[u8], limit: usize) -> Result<Self, ProtocolError> {
        if raw.len() > limit {
            return Err(ProtocolError::MessageTooLarge {
                size: raw.len(),
                limit,
            });
        }

        let line = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::MalformedMessage("not valid utf-8".to_string()))?
            .trim();

        let mut parts = line.split_whitespace();

        let type_token = parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedMessage("empty message".to_string()))?;
        let msg_type = MessageType::from_str(type_token)
            .ok_or_else(|| ProtocolError::UnknownMessageType(type_token.to_string()))?;

        let host_id = parts
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ProtocolError::MalformedMessage("missing host id".to_string()))?;

        let timestamp = parts
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ProtocolError::MalformedMessage("missing timestamp".to_string()))?;

        let payload = match parts.next() {
            None | Some("-") => String::new(),
            Some(b64) => {
                let bytes = B64.decode(b64).map_err(|e| {
                    ProtocolError::MalformedMessage(format!("bad payload encoding: {e}"))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    ProtocolError::MalformedMessage("payload is not valid utf-8".to_string())
                })?
            }
        };

        if parts.next().is_some() {
            return Err(ProtocolError::MalformedMessage(
                "trailing tokens after payload".to_string(),
            ));
        }

        Ok(Message {
            msg_type,
            host_id,
            timestamp,
            payload,
        })
    }
}
