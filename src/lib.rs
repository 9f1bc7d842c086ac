//! # S2 - Flexibility Protocol Connection Engine
//!
//! Connection and protocol engine for the S2 energy flexibility protocol
//! (EN 50491-12-2), spoken between a Customer Energy Manager (CEM) and the
//! Resource Managers (RM) of devices such as heat pumps, batteries and EV
//! chargers.
//!
//! ## Features
//!
//! - **Acknowledgment tracking**: every message with a `message_id` gets
//!   exactly one `ReceptionStatus`, on both the sending and receiving side
//! - **Ordered dispatch**: inbound messages reach their handlers one at a
//!   time, in arrival order
//! - **Session supervision**: automatic reconnect with renegotiation from
//!   `Handshake`
//! - **RM lifecycle**: handshake, details exchange and control type switching
//! - **Pluggable media**: WebSocket out of the box, in-process channels for
//!   tests
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─────────────────────── Connection ───────────────────────┐
//!                 │                                                           │
//!  Medium ──────▶ │ receive loop ──┬── ReceptionStatus ──▶ Awaiter ──▶ send_and_await_ack
//!  (WebSocket)    │                │                                          │
//!                 │                └── other ──▶ queue ──▶ dispatch loop      │
//!                 │                                          │                │
//!                 │                                  HandlerRegistry          │
//!                 │                                  (+ AckCapsule)           │
//!                 └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use s2::config::Config;
//! use s2::connection::Connection;
//! use s2::control::{NoControl, ResourceManagerHandler};
//!
//! let config = Config::from_env();
//! let conn = Connection::over_websocket(config.connection.clone());
//!
//! let rm = Arc::new(
//!     ResourceManagerHandler::new(config.resource_manager.clone())
//!         .with_control_type(Arc::new(NoControl)),
//! );
//! rm.attach(&conn);
//!
//! conn.start()?;
//! conn.wait_stopped().await;
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Engine, acknowledgment awaiter, handler dispatch
//! - [`control`]: Control types and the Resource Manager lifecycle
//! - [`protocol`]: Message envelope, typed core messages, parser
//! - [`medium`]: Transports carrying text frames
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod medium;
pub mod protocol;

// Re-exports for convenience
pub use config::Config;
pub use connection::{BlockingConnection, Connection, ConnectionState};
pub use control::{ControlType, ResourceManagerHandler};
pub use error::{Result, S2Error};
pub use medium::{Medium, WebSocketMedium};
pub use protocol::{Message, ReceptionStatus, ReceptionStatusValues};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
