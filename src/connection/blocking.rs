//! Blocking façade over [`Connection`].
//!
//! For embedders without an async runtime. The engine runs on a dedicated
//! `s2-connection` thread driving a current-thread tokio runtime; every
//! blocking call submits work to that runtime and waits for the result.
//! Handlers run on the loop thread, so blocking calls made from a handler
//! fail with [`S2Error::IllegalState`] instead of deadlocking.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::{Connection, ConnectionState, MessageHandler};
use crate::config::ConnectionConfig;
use crate::error::{Result, S2Error};
use crate::medium::Medium;
use crate::protocol::{Message, Parser, ReceptionStatus};

const LOOP_THREAD_NAME: &str = "s2-connection";

/// Synchronous handle to a connection running on its own thread.
pub struct BlockingConnection {
    conn: Connection,
    handle: Handle,
    loop_thread: ThreadId,
    exit: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingConnection {
    /// Spawn the loop thread and create an idle connection on it.
    pub fn new(config: ConnectionConfig, medium: Arc<dyn Medium>, parser: Arc<dyn Parser>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (exit, exited) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = exited.await;
                });
                tracing::debug!("S2 loop thread exiting");
            })?;

        Ok(Self {
            conn: Connection::new(config, medium, parser),
            handle,
            loop_thread: thread.thread().id(),
            exit: Mutex::new(Some(exit)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Underlying async connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runtime driven by the loop thread
    pub fn runtime_handle(&self) -> &Handle {
        &self.handle
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Register `handler` for inbound messages of `message_type`.
    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.conn.register_handler(message_type, handler);
    }

    /// Start the connection on the loop thread and return immediately.
    pub fn start(&self) -> Result<()> {
        let _runtime = self.handle.enter();
        self.conn.start()
    }

    /// Start the connection and block until it stops.
    pub fn run(&self) -> Result<()> {
        self.ensure_off_loop("run")?;
        self.start()?;
        let conn = self.conn.clone();
        self.block_on(async move {
            conn.wait_stopped().await;
            Ok(())
        })
    }

    /// Stop the connection and wait for it to unwind.
    pub fn stop(&self) -> Result<()> {
        self.ensure_off_loop("stop")?;
        let conn = self.conn.clone();
        self.block_on(async move {
            conn.stop().await;
            Ok(())
        })
    }

    /// Block until the connection reaches `state`, up to `timeout`.
    ///
    /// Returns whether the state was reached.
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> Result<bool> {
        self.ensure_off_loop("wait_for_state")?;
        let conn = self.conn.clone();
        self.block_on(async move {
            Ok(tokio::time::timeout(timeout, conn.wait_for_state(state))
                .await
                .is_ok())
        })
    }

    /// Blocking [`Connection::send_and_forget`].
    pub fn send_and_forget(&self, message: &Message) -> Result<()> {
        self.ensure_off_loop("send_and_forget")?;
        let conn = self.conn.clone();
        let message = message.clone();
        self.block_on(async move { conn.send_and_forget(&message).await })
    }

    /// Blocking [`Connection::send_and_await_ack`].
    pub fn send_and_await_ack(
        &self,
        message: &Message,
        timeout: Duration,
        raise_on_error: bool,
    ) -> Result<ReceptionStatus> {
        self.ensure_off_loop("send_and_await_ack")?;
        let conn = self.conn.clone();
        let message = message.clone();
        self.block_on(async move {
            conn.send_and_await_ack(&message, timeout, raise_on_error)
                .await
        })
    }

    fn on_loop_thread(&self) -> bool {
        std::thread::current().id() == self.loop_thread
    }

    fn ensure_off_loop(&self, operation: &str) -> Result<()> {
        if self.on_loop_thread() {
            return Err(S2Error::IllegalState(format!(
                "{operation} would block the {LOOP_THREAD_NAME} thread"
            )));
        }
        Ok(())
    }

    fn block_on<T, F>(&self, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        match futures::executor::block_on(self.handle.spawn(future)) {
            Ok(result) => result,
            Err(e) => Err(S2Error::IllegalState(format!("loop task failed: {e}"))),
        }
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        self.conn.request_stop();
        if self.on_loop_thread() {
            return;
        }

        if let Err(e) = self.stop() {
            tracing::debug!("Stopping on drop failed: {}", e);
        }
        if let Some(exit) = self.exit.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = exit.send(());
        }
        if let Some(thread) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if thread.join().is_err() {
                tracing::error!("S2 loop thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::ChannelMedium;
    use crate::protocol::JsonParser;
    use uuid::Uuid;

    fn facade() -> (Arc<BlockingConnection>, crate::medium::ChannelPeer) {
        let (medium, peer) = ChannelMedium::new();
        let facade = BlockingConnection::new(
            ConnectionConfig::default().with_reconnect(false),
            medium,
            Arc::new(JsonParser::new()),
        )
        .unwrap();
        (Arc::new(facade), peer)
    }

    #[test]
    fn test_start_and_stop_from_caller_thread() {
        let (facade, mut peer) = facade();
        facade.start().unwrap();

        let session = futures::executor::block_on(peer.accept()).unwrap();
        assert!(facade
            .wait_for_state(ConnectionState::Active, Duration::from_secs(2))
            .unwrap());

        facade.stop().unwrap();
        assert_eq!(facade.state(), ConnectionState::Stopped);
        drop(session);
    }

    #[test]
    fn test_send_reaches_peer() {
        let (facade, mut peer) = facade();
        facade.start().unwrap();
        let mut session = futures::executor::block_on(peer.accept()).unwrap();

        let status = ReceptionStatus::ok(Uuid::new_v4());
        facade
            .send_and_forget(&Message::from_typed(&status).unwrap())
            .unwrap();

        let sent = futures::executor::block_on(session.recv_json()).unwrap();
        assert_eq!(sent["message_type"], "ReceptionStatus");
        facade.stop().unwrap();
    }

    #[test]
    fn test_stop_from_loop_thread_is_illegal() {
        let (facade, _peer) = facade();
        facade.start().unwrap();

        let on_loop = facade.clone();
        let result = futures::executor::block_on(
            facade
                .runtime_handle()
                .spawn(async move { on_loop.stop() }),
        )
        .unwrap();

        assert!(matches!(result, Err(S2Error::IllegalState(_))));
        facade.stop().unwrap();
    }

    #[test]
    fn test_loop_thread_is_named() {
        let (facade, _peer) = facade();
        let name = futures::executor::block_on(
            facade
                .runtime_handle()
                .spawn(async { std::thread::current().name().map(str::to_owned) }),
        )
        .unwrap();
        assert_eq!(name.as_deref(), Some(LOOP_THREAD_NAME));
    }
}
