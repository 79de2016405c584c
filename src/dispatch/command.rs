use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single unit of remote work received from the dispatch server.
///
/// Commands are consumed exactly once: the dispatcher hands each one to the
/// handler registered for its `command_type` and produces one ack.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub command_type: String,
    pub payload: Value,
    /// Stamped when the frame is read off the control connection.
    pub received_at: DateTime<Utc>,
}

impl Command {
    pub fn new(id: impl Into<String>, command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            command_type: command_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}
