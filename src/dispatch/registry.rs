use crate::dispatch::ack::{AckResult, HandlerReport};
use crate::dispatch::command::Command;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub type HandlerFuture<'a> = BoxFuture<'a, Result<HandlerReport>>;

/// Trait implemented by business modules that execute commands.
///
/// Handlers receive the raw command payload and return counters describing
/// what they accomplished. Always async so implementations can perform I/O.
pub trait CommandHandler: Send + Sync + 'static {
    fn execute<'a>(&'a self, payload: &'a Value) -> HandlerFuture<'a>;
}

/// Error raised at registration time, before any command flows.
#[derive(Debug)]
pub enum DispatchError {
    DuplicateHandler { command_type: String },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::DuplicateHandler { command_type } => {
                write!(f, "a handler is already registered for {command_type}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Maps command types to their handlers and turns each command into exactly
/// one ack. Handler errors and panics are contained here; they never take
/// the connection down.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    telemetry: Arc<Telemetry>,
}

impl Dispatcher {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            handlers: HashMap::new(),
            telemetry,
        }
    }

    /// Registers a handler for a command type. Registration happens during
    /// startup wiring; duplicates are configuration mistakes and error out.
    pub fn register(
        &mut self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DispatchError> {
        let command_type = command_type.into();
        if self.handlers.contains_key(&command_type) {
            return Err(DispatchError::DuplicateHandler { command_type });
        }
        self.handlers.insert(command_type, handler);
        Ok(())
    }

    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Routes one command to its handler and builds the ack.
    pub async fn dispatch(&self, command: Command) -> AckResult {
        let Some(handler) = self.handlers.get(&command.command_type) else {
            tracing::warn!(
                command_id = %command.id,
                command_type = %command.command_type,
                "no handler registered for command type"
            );
            self.telemetry.record_handler_failure();
            return AckResult::unknown_command(command.id);
        };

        self.telemetry.record_command_dispatched();
        let started = std::time::Instant::now();
        let outcome = std::panic::AssertUnwindSafe(handler.execute(&command.payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    requested = report.requested,
                    inserted = report.inserted,
                    skipped = report.skipped,
                    failed = report.failed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command completed"
                );
                AckResult::from_report(command.id, &report)
            }
            Ok(Err(err)) => {
                tracing::error!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    error = %err,
                    "handler failed"
                );
                self.telemetry.record_handler_failure();
                AckResult::handler_failure(command.id)
            }
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    panic = %panic_msg,
                    "handler panicked"
                );
                self.telemetry.record_handler_failure();
                AckResult::handler_failure(command.id)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
