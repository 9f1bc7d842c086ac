//! Transport abstraction for S2 connections.
//!
//! A [`Medium`] carries whole JSON text frames in both directions. The engine
//! never touches sockets directly; it only connects, sends, receives and
//! closes through this trait.
//!
//! Backends:
//! - **WebSocket** ([`WebSocketMedium`]): the standard S2 transport, with an
//!   optional bearer token attached at connect time.
//! - **Channel** ([`ChannelMedium`]): in-process pair of channels, used to
//!   script a peer in tests and demos.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use s2::medium::WebSocketMedium;
//!
//! let medium = Arc::new(WebSocketMedium::new("wss://cem.example/s2").with_bearer_token(token));
//! ```

mod channel;
mod websocket;

pub use channel::{ChannelMedium, ChannelPeer, PeerSession};
pub use websocket::WebSocketMedium;

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Boxed future returned by [`Medium`] operations.
pub type MediumFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Bidirectional text-frame transport.
///
/// Implementations use interior mutability: the engine receives on one task
/// while other tasks send concurrently.
pub trait Medium: Send + Sync {
    /// Open the transport.
    ///
    /// Fails with [`S2Error::MediumCouldNotConnect`](crate::S2Error::MediumCouldNotConnect).
    /// Calling `connect` again after a close opens a fresh session.
    fn connect(&self) -> MediumFuture<'_, ()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Send one text frame.
    ///
    /// Fails with [`S2Error::MediumClosed`](crate::S2Error::MediumClosed).
    fn send(&self, text: String) -> MediumFuture<'_, ()>;

    /// Wait for the next inbound text frame.
    ///
    /// Fails with [`S2Error::MediumClosed`](crate::S2Error::MediumClosed) once
    /// the peer has disconnected. Dropping the future before it completes
    /// must not lose a frame.
    fn receive(&self) -> MediumFuture<'_, String>;

    /// Close the transport. Closing twice is a no-op.
    fn close(&self) -> MediumFuture<'_, ()>;

    /// Get the medium name for logging.
    fn name(&self) -> &'static str;
}
