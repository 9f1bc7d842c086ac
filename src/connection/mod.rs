//! S2 connection engine.
//!
//! A [`Connection`] owns one [`Medium`](crate::medium::Medium) and drives it
//! through a sequence of sessions. Each session runs two tasks: a receive loop
//! that parses frames and routes acknowledgments to the
//! [`ReceptionStatusAwaiter`], and a dispatch loop that runs handlers one
//! message at a time, in arrival order.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐ start() ┌────────────┐ connected ┌────────┐
//! │ Idle │────────▶│ Connecting │──────────▶│ Active │
//! └──────┘         └────────────┘           └────────┘
//!                     ▲      │                  │
//!            reconnect│      │ failed,          │ stop() or session
//!                     │      │ no reconnect     │ ends, no reconnect
//!                     │      ▼                  ▼
//!                     │  ┌─────────┐      ┌──────────┐
//!                     └──│ session │      │ Stopping │
//!                        │  ended  │      └──────────┘
//!                        └─────────┘            │
//!                                               ▼
//!                                          ┌─────────┐
//!                                          │ Stopped │
//!                                          └─────────┘
//! ```
//!
//! A session ends when the medium closes, an acknowledgment times out, a
//! start hook fails, the peer sends a duplicate acknowledgment, or
//! [`Connection::request_restart`] is called. Teardown order is fixed: the
//! dispatch loop halts, end hooks run, the receive loop stops, pending
//! acknowledgment waiters fail with `ConnectionTerminated`, and the medium is
//! closed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use s2::config::ConnectionConfig;
//! use s2::connection::{handler_fn, Connection};
//! use s2::medium::WebSocketMedium;
//! use s2::protocol::JsonParser;
//!
//! let conn = Connection::new(
//!     ConnectionConfig::default(),
//!     Arc::new(WebSocketMedium::new("ws://cem.local:8080/s2")),
//!     Arc::new(JsonParser::new()),
//! );
//! conn.register_handler(
//!     "PowerForecast",
//!     handler_fn(|_conn, _msg, ack| async move { ack.ok().await }),
//! );
//! conn.start()?;
//! ```

mod awaiter;
mod blocking;
mod dispatcher;
mod engine;

pub use awaiter::ReceptionStatusAwaiter;
pub use blocking::BlockingConnection;
pub use dispatcher::{handler_fn, AckCapsule, HandlerRegistry, MessageHandler};
pub use engine::{Connection, SessionHooks};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not started
    Idle,
    /// Opening the medium
    Connecting,
    /// Session running
    Active,
    /// Shutting down
    Stopping,
    /// Terminal; all tasks have unwound
    Stopped,
}

impl ConnectionState {
    /// Whether the connection can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}
