//! WebSocket medium.
//!
//! Client side of the standard S2 transport, built on tokio-tungstenite.
//! Only text frames carry S2 messages; ping/pong and binary frames are
//! skipped, and a close frame ends the inbound stream.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Medium, MediumFuture};
use crate::error::{S2Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport to an S2 peer.
pub struct WebSocketMedium {
    url: String,
    bearer_token: Option<String>,
    sink: Mutex<Option<SplitSink<WsStream, Frame>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
}

impl WebSocketMedium {
    /// Create a medium for the given `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Attach `Authorization: Bearer <token>` when connecting.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Peer URL
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| S2Error::MediumCouldNotConnect(format!("Invalid URL {}: {e}", self.url)))?;

        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                S2Error::MediumCouldNotConnect(format!("Invalid bearer token: {e}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                S2Error::MediumCouldNotConnect(format!("Failed to connect to {}: {e}", self.url))
            })?;

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!("WebSocket connected to {}", self.url);
        Ok(())
    }

    async fn send_frame(&self, text: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(S2Error::MediumClosed)?;

        if let Err(e) = sink.send(Frame::Text(text.into())).await {
            tracing::debug!("WebSocket send failed: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            return Err(S2Error::MediumClosed);
        }
        Ok(())
    }

    async fn next_text(&self) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(S2Error::MediumClosed)?;

        loop {
            match stream.next().await {
                Some(Ok(Frame::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Frame::Close(frame))) => {
                    tracing::debug!("WebSocket closed by peer: {:?}", frame);
                    break;
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {}", e);
                    break;
                },
                None => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Err(S2Error::MediumClosed)
    }

    async fn shutdown(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!("WebSocket close failed: {}", e);
            }
        }
        // The receive loop may still hold the stream; it sees the close frame.
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
        Ok(())
    }
}

impl Medium for WebSocketMedium {
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
        "WebSocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_is_closed() {
        let medium = WebSocketMedium::new("ws://127.0.0.1:1/s2");
        assert!(!medium.is_connected());
        assert!(matches!(
            medium.send("{}".to_string()).await,
            Err(S2Error::MediumClosed)
        ));
        assert!(matches!(medium.receive().await, Err(S2Error::MediumClosed)));
    }

    #[tokio::test]
    async fn test_invalid_url_could_not_connect() {
        let medium = WebSocketMedium::new("not a url");
        assert!(matches!(
            medium.connect().await,
            Err(S2Error::MediumCouldNotConnect(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_could_not_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let medium = WebSocketMedium::new(format!("ws://127.0.0.1:{port}/s2"))
            .with_bearer_token("token");
        assert!(matches!(
            medium.connect().await,
            Err(S2Error::MediumCouldNotConnect(_))
        ));
        assert!(!medium.is_connected());
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let medium = WebSocketMedium::new("ws://127.0.0.1:1/s2");
        medium.close().await.unwrap();
        medium.close().await.unwrap();
        assert_eq!(medium.name(), "WebSocket");
        assert_eq!(medium.url(), "ws://127.0.0.1:1/s2");
    }
}
