//! In-process medium backed by tokio channels.
//!
//! Every successful `connect()` opens a fresh pair of channels and hands the
//! far end to the [`ChannelPeer`] as a [`PeerSession`]. Dropping or
//! disconnecting a `PeerSession` looks to the engine exactly like a peer
//! hanging up a WebSocket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{Medium, MediumFuture};
use crate::error::{S2Error, Result};

/// Medium whose peer lives in the same process.
pub struct ChannelMedium {
    sessions: UnboundedSender<PeerSession>,
    outbound: Mutex<Option<UnboundedSender<String>>>,
    inbound: tokio::sync::Mutex<Option<UnboundedReceiver<String>>>,
    connected: AtomicBool,
    connect_attempts: AtomicUsize,
    refuse_connects: AtomicUsize,
}

impl ChannelMedium {
    /// Create a medium and the peer side that accepts its connections.
    pub fn new() -> (Arc<Self>, ChannelPeer) {
        let (sessions, accepted) = mpsc::unbounded_channel();
        let medium = Arc::new(Self {
            sessions,
            outbound: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            refuse_connects: AtomicUsize::new(0),
        });
        (medium, ChannelPeer { accepted })
    }

    /// Number of `connect()` calls so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make the next `count` connects fail with `MediumCouldNotConnect`.
    pub fn refuse_next_connects(&self, count: usize) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    async fn open(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(S2Error::MediumCouldNotConnect(
                "connection refused".to_string(),
            ));
        }

        let (to_peer, from_engine) = mpsc::unbounded_channel();
        let (to_engine, from_peer) = mpsc::unbounded_channel();

        self.sessions
            .send(PeerSession {
                to_engine: Some(to_engine),
                from_engine,
            })
            .map_err(|_| S2Error::MediumCouldNotConnect("peer is gone".to_string()))?;

        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(to_peer);
        *self.inbound.lock().await = Some(from_peer);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_frame(&self, text: String) -> Result<()> {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match outbound {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                Err(S2Error::MediumClosed)
            },
        }
    }

    async fn next_text(&self) -> Result<String> {
        let mut guard = self.inbound.lock().await;
        let received = match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        received.ok_or_else(|| {
            self.connected.store(false, Ordering::SeqCst);
            S2Error::MediumClosed
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.take();
        }
        Ok(())
    }
}

impl Medium for ChannelMedium {
    fn connect(&self) -> MediumFuture<'_, ()> {
        Box::pin(self.open())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> MediumFuture<'_, ()> {
        Box::pin(self.send_frame(text))
    }

    fn receive(&self) -> MediumFuture<'_, String> {
        Box::pin(self.next_text())
    }

    fn close(&self) -> MediumFuture<'_, ()> {
        Box::pin(self.shutdown())
    }

    fn name(&self) -> &'static str {
        "Channel"
    }
}

/// Accepting side of a [`ChannelMedium`].
pub struct ChannelPeer {
    accepted: UnboundedReceiver<PeerSession>,
}

impl ChannelPeer {
    /// Wait for the engine's next connection.
    pub async fn accept(&mut self) -> Option<PeerSession> {
        self.accepted.recv().await
    }

    /// Wait for the next connection, giving up after `timeout`.
    pub async fn accept_within(&mut self, timeout: Duration) -> Option<PeerSession> {
        tokio::time::timeout(timeout, self.accepted.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Peer end of one connection.
pub struct PeerSession {
    to_engine: Option<UnboundedSender<String>>,
    from_engine: UnboundedReceiver<String>,
}

impl PeerSession {
    /// Send a raw text frame to the engine.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.to_engine
            .as_ref()
            .and_then(|tx| tx.send(text.into()).ok())
            .ok_or(S2Error::MediumClosed)
    }

    /// Send a JSON value to the engine.
    pub fn send_json(&self, value: &Value) -> Result<()> {
        self.send(serde_json::to_string(value)?)
    }

    /// Wait for the next frame from the engine.
    ///
    /// Returns `None` once the engine has closed the medium.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_engine.recv().await
    }

    /// Wait for the next frame from the engine and decode it as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let raw = self.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Wait for the next frame, giving up after `timeout`.
    pub async fn recv_json_within(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json())
            .await
            .ok()
            .flatten()
    }

    /// Hang up; the engine's receive fails with `MediumClosed`.
    pub fn disconnect(&mut self) {
        self.to_engine.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (medium, mut peer) = ChannelMedium::new();
        medium.connect().await.unwrap();
        let mut session = peer.accept().await.unwrap();

        medium.send("to peer".to_string()).await.unwrap();
        assert_eq!(session.recv().await.as_deref(), Some("to peer"));

        session.send("to engine").unwrap();
        assert_eq!(medium.receive().await.unwrap(), "to engine");
        assert!(medium.is_connected());
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_receive() {
        let (medium, mut peer) = ChannelMedium::new();
        medium.connect().await.unwrap();
        let mut session = peer.accept().await.unwrap();

        session.disconnect();
        assert!(matches!(medium.receive().await, Err(S2Error::MediumClosed)));
        assert!(!medium.is_connected());
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (medium, mut peer) = ChannelMedium::new();
        medium.connect().await.unwrap();
        let mut session = peer.accept().await.unwrap();

        medium.close().await.unwrap();
        assert!(session.recv().await.is_none());
        assert!(matches!(
            medium.send("late".to_string()).await,
            Err(S2Error::MediumClosed)
        ));
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted() {
        let (medium, mut peer) = ChannelMedium::new();
        medium.refuse_next_connects(2);

        assert!(medium.connect().await.is_err());
        assert!(medium.connect().await.is_err());
        medium.connect().await.unwrap();

        assert_eq!(medium.connect_attempts(), 3);
        assert!(peer.accept().await.is_some());
    }
}
