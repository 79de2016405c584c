//! Command routing: typed command/ack structures, the `CommandHandler`
//! trait implemented by business modules, and the dispatcher registry that
//! maps command types to handlers.

pub mod ack;
pub mod command;
pub mod registry;

pub use ack::{AckErrorKind, AckResult, AckStatus, HandlerReport};
pub use command::Command;
pub use registry::{CommandHandler, DispatchError, Dispatcher, HandlerFuture};
