//! Control-connection plumbing: wire frames, reconnect backoff, and the
//! websocket connection manager that owns the session lifecycle.

pub mod backoff;
pub mod frames;
pub mod manager;

pub use frames::Frame;
pub use manager::{
    ConnectionError, ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState,
};
