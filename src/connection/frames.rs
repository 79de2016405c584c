use crate::dispatch::ack::{AckErrorKind, AckStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON text frames exchanged over the control connection.
///
/// `auth`, `ack`, and `ping` travel client-to-server; `auth_ok`,
/// `auth_error`, `command`, `pong`, and `shutdown` travel server-to-client.
/// Unknown frame types are logged and dropped by the reader, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Auth {
        module_hash: String,
    },
    AuthOk,
    AuthError {
        message: String,
    },
    Command {
        id: String,
        command_type: String,
        #[serde(default)]
        payload: Value,
    },
    Ack {
        command_id: String,
        status: AckStatus,
        summary: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckErrorKind>,
    },
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    Shutdown,
}

impl Frame {
    pub fn ping_now() -> Self {
        Frame::Ping {
            ts: Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode frame")
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to decode frame")
    }
}
