use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome class reported back to the dispatch server for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Partial,
    Error,
}

/// Machine-readable failure category carried on ERROR acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckErrorKind {
    UnknownCommandType,
    HandlerFailure,
}

/// Per-command counters produced by a handler run.
///
/// `requested` counts the targets named by the command payload; `inserted`
/// and `skipped` count persisted records (a target can yield several records);
/// `failed` counts targets that produced nothing usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerReport {
    pub requested: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl HandlerReport {
    pub fn with_requested(requested: u64) -> Self {
        Self {
            requested,
            ..Self::default()
        }
    }
}

/// Structured acknowledgement for one dispatched command. Built once by the
/// dispatcher and sent exactly once over the control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResult {
    pub command_id: String,
    pub status: AckStatus,
    pub summary: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckErrorKind>,
}

impl AckResult {
    /// Maps a completed handler report onto an ack.
    ///
    /// `failed == 0` is a full success; a mix of failures and successes is
    /// PARTIAL; a report where every target failed is an ERROR, since the
    /// command produced nothing.
    pub fn from_report(command_id: impl Into<String>, report: &HandlerReport) -> Self {
        let (status, error) = if report.failed == 0 {
            (AckStatus::Ok, None)
        } else if report.failed < report.requested {
            (AckStatus::Partial, None)
        } else {
            (AckStatus::Error, Some(AckErrorKind::HandlerFailure))
        };

        Self {
            command_id: command_id.into(),
            status,
            summary: summary_value(report),
            error,
        }
    }

    pub fn unknown_command(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Error,
            summary: summary_value(&HandlerReport::default()),
            error: Some(AckErrorKind::UnknownCommandType),
        }
    }

    pub fn handler_failure(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Error,
            summary: summary_value(&HandlerReport::default()),
            error: Some(AckErrorKind::HandlerFailure),
        }
    }
}

fn summary_value(report: &HandlerReport) -> Value {
    serde_json::json!({
        "requested": report.requested,
        "inserted": report.inserted,
        "skipped": report.skipped,
        "failed": report.failed,
    })
}
