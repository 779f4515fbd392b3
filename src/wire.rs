//! Wire values for the discover and capture sub-protocols
//!
//! Both sub-protocols exchange a single request and a single response as raw
//! UTF-8. The literal tokens live here behind typed values so the rest of the
//! crate never compares strings directly.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Payload of every discover request.
pub const DISCOVER_REQUEST: &str = "discover";

pub const MANAGER_TOKEN: &str = "phonendo_manager";
pub const READER_TOKEN: &str = "phonendo_reader";

const ACK_STORED: &str = "true";
const ACK_DISCARDED: &str = "false";

/// Named, versioned request/response sub-protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubProtocol {
    Discover,
    Capture,
}

impl SubProtocol {
    pub const VERSION: &'static str = "1.0.0";

    /// Protocol id negotiated on the stream, e.g. `/discover/1.0.0`.
    pub fn protocol_id(&self) -> &'static str {
        match self {
            SubProtocol::Discover => "/discover/1.0.0",
            SubProtocol::Capture => "/capture/1.0.0",
        }
    }
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_id())
    }
}

/// Role announced by a peer in its discover response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Manager,
    Reader,
    Other(String),
}

impl Role {
    pub fn from_payload(payload: &[u8]) -> Self {
        match String::from_utf8_lossy(payload).as_ref() {
            MANAGER_TOKEN => Role::Manager,
            READER_TOKEN => Role::Reader,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Role::Manager => MANAGER_TOKEN,
            Role::Reader => READER_TOKEN,
            Role::Other(token) => token,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Telemetry message relayed to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMessage {
    pub value: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl CaptureMessage {
    pub fn new(value: impl Into<String>, timestamp: i64) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }

    /// Fresh message with a random token and the current time.
    pub fn simulate() -> Self {
        Self::new(Uuid::new_v4().to_string(), Utc::now().timestamp_millis())
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RelayError::Decode(e.to_string()))
    }
}

/// Manager acknowledgement of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Stored,
    Discarded,
}

impl CaptureOutcome {
    /// Only the exact literal `true` counts as stored.
    pub fn from_ack(payload: &[u8]) -> Self {
        if payload == ACK_STORED.as_bytes() {
            CaptureOutcome::Stored
        } else {
            CaptureOutcome::Discarded
        }
    }

    pub fn ack(&self) -> &'static str {
        match self {
            CaptureOutcome::Stored => ACK_STORED,
            CaptureOutcome::Discarded => ACK_DISCARDED,
        }
    }
}

impl fmt::Display for CaptureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureOutcome::Stored => f.write_str("stored"),
            CaptureOutcome::Discarded => f.write_str("discarded"),
        }
    }
}
