//! Connection engine: session supervisor, receive loop and dispatch loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::awaiter::ReceptionStatusAwaiter;
use super::dispatcher::{HandlerRegistry, MessageHandler};
use super::ConnectionState;
use crate::config::ConnectionConfig;
use crate::error::{Result, S2Error};
use crate::medium::{Medium, WebSocketMedium};
use crate::protocol::{JsonParser, Message, Parser, ReceptionStatus};

/// Callbacks around each session of a connection.
///
/// Start hooks run once the session is `Active`, concurrently with the
/// receive loop so they can await acknowledgments. A failing start hook ends
/// the session. End hooks run after the dispatch loop has halted and before
/// the medium is closed.
pub trait SessionHooks: Send + Sync {
    /// Called when a new session is active.
    fn on_session_start(&self, conn: Connection) -> BoxFuture<'_, Result<()>>;

    /// Called when a session is being torn down.
    fn on_session_end(&self, conn: Connection) -> BoxFuture<'_, Result<()>>;
}

struct Inner {
    config: ConnectionConfig,
    medium: Arc<dyn Medium>,
    parser: Arc<dyn Parser>,
    awaiter: ReceptionStatusAwaiter,
    registry: HandlerRegistry,
    hooks: RwLock<Vec<Arc<dyn SessionHooks>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    session: Mutex<Option<Arc<watch::Sender<bool>>>>,
    sessions_opened: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one S2 connection.
///
/// Cheap to clone; all clones drive the same engine. Handlers receive a clone
/// so they can send messages and register further handlers.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// How the select over a session's tasks ended.
enum SessionEnd {
    Shutdown,
    Terminated,
    Receiver(std::result::Result<Result<()>, tokio::task::JoinError>),
    Dispatcher(std::result::Result<Result<()>, tokio::task::JoinError>),
}

impl Connection {
    /// Create an idle connection over `medium`.
    pub fn new(config: ConnectionConfig, medium: Arc<dyn Medium>, parser: Arc<dyn Parser>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                medium,
                parser,
                awaiter: ReceptionStatusAwaiter::new(),
                registry: HandlerRegistry::new(),
                hooks: RwLock::new(Vec::new()),
                state,
                shutdown,
                session: Mutex::new(None),
                sessions_opened: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Create an idle connection to `config.url` over WebSocket.
    pub fn over_websocket(config: ConnectionConfig) -> Self {
        let mut medium = WebSocketMedium::new(config.url.clone());
        if let Some(token) = &config.bearer_token {
            medium = medium.with_bearer_token(token.clone());
        }
        Self::new(config, Arc::new(medium), Arc::new(JsonParser::new()))
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Number of sessions opened so far (reconnects included)
    pub fn session_count(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Wait until the connection reaches `state`.
    ///
    /// Only observes the latest state; a state that was entered and left
    /// before this call may be missed.
    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Wait until the connection has fully stopped.
    pub async fn wait_stopped(&self) {
        self.wait_for_state(ConnectionState::Stopped).await;
    }

    /// Register `handler` for inbound messages of `message_type`.
    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.registry.register(message_type, handler);
    }

    /// Remove the handler for `message_type`, if any.
    pub fn unregister_handler(&self, message_type: &str) {
        self.inner.registry.unregister(message_type);
    }

    /// Check if a handler is registered for `message_type`.
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.inner.registry.contains(message_type)
    }

    /// Add callbacks run at the start and end of every session.
    pub fn add_session_hooks(&self, hooks: Arc<dyn SessionHooks>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hooks);
    }

    /// Start the connection in the background.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`S2Error::IllegalState`] unless the connection is `Idle`.
    pub fn start(&self) -> Result<()> {
        let mut supervisor = lock(&self.inner.supervisor);
        let state = self.state();
        if state != ConnectionState::Idle {
            return Err(S2Error::IllegalState(format!(
                "Cannot start connection in state {state:?}"
            )));
        }

        self.set_state(ConnectionState::Connecting);
        let conn = self.clone();
        *supervisor = Some(tokio::spawn(async move { conn.supervise().await }));
        Ok(())
    }

    /// Ask the connection to stop without waiting for it.
    pub fn request_stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Active => {
                *state = ConnectionState::Stopping;
                true
            },
            _ => false,
        });
    }

    /// Stop the connection and wait until all background tasks have unwound.
    pub async fn stop(&self) {
        self.request_stop();

        let supervisor = lock(&self.inner.supervisor).take();
        match supervisor {
            Some(handle) => {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::error!("Connection supervisor failed: {}", e);
                    }
                }
            },
            None => {
                let never_started = self.inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Idle {
                        *state = ConnectionState::Stopped;
                        true
                    } else {
                        false
                    }
                });
                if never_started {
                    return;
                }
            },
        }

        self.wait_stopped().await;
    }

    /// End the current session; the supervisor reconnects or stops per config.
    pub fn request_restart(&self, reason: &str) {
        let session = lock(&self.inner.session).clone();
        if let Some(session) = session {
            let first = session.send_if_modified(|terminated| !std::mem::replace(terminated, true));
            if first {
                tracing::warn!("Ending S2 session: {}", reason);
            }
        }
    }

    /// Encode `message` and hand it to the medium.
    ///
    /// A closed medium ends the current session and returns
    /// [`S2Error::MediumClosed`].
    pub async fn send_and_forget(&self, message: &Message) -> Result<()> {
        let text = message.to_json()?;

        match self.inner.medium.send(text).await {
            Ok(()) => {
                tracing::debug!(
                    "Sent {} {:?}",
                    message.message_type(),
                    message.message_id()
                );
                Ok(())
            },
            Err(e) => {
                if e.is_transport() {
                    self.request_restart(&format!(
                        "could not send {}: {e}",
                        message.message_type()
                    ));
                }
                Err(e)
            },
        }
    }

    /// Send `message` and wait for its `ReceptionStatus`.
    ///
    /// Fails with [`S2Error::ConnectionTerminated`] if the session ends first,
    /// and with [`S2Error::AckTimeout`] after `timeout`, which also ends the
    /// session. A non-OK status becomes [`S2Error::AckRejected`] when
    /// `raise_on_error` is set.
    pub async fn send_and_await_ack(
        &self,
        message: &Message,
        timeout: Duration,
        raise_on_error: bool,
    ) -> Result<ReceptionStatus> {
        let message_id = message.message_id().ok_or_else(|| {
            S2Error::IllegalState(format!(
                "{} has no message_id to acknowledge",
                message.message_type()
            ))
        })?;

        let mut terminated = lock(&self.inner.session)
            .as_ref()
            .map(|session| session.subscribe())
            .ok_or(S2Error::ConnectionTerminated)?;

        self.send_and_forget(message).await?;

        let outcome = tokio::select! {
            status = self.inner.awaiter.wait_for(message_id, timeout) => status,
            _ = signalled(&mut terminated) => Err(S2Error::ConnectionTerminated),
        };

        let status = match outcome {
            Ok(status) => status,
            Err(e @ S2Error::AckTimeout { .. }) => {
                self.request_restart(&e.to_string());
                return Err(e);
            },
            Err(e) => return Err(e),
        };

        if raise_on_error && !status.is_ok() {
            return Err(S2Error::AckRejected(status));
        }
        Ok(status)
    }

    /// Send `message` with the configured timeout and require an `OK`.
    pub async fn send_and_await_ok(&self, message: &Message) -> Result<ReceptionStatus> {
        self.send_and_await_ack(message, self.inner.config.ack_timeout(), true)
            .await
    }

    /// Send an acknowledgment for an inbound message.
    pub async fn send_reception_status(&self, status: ReceptionStatus) -> Result<()> {
        self.send_and_forget(&Message::from_typed(&status)?).await
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    async fn supervise(self) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.run_session(&mut shutdown).await {
                Ok(()) => tracing::info!("S2 session closed"),
                Err(e) => tracing::warn!("S2 session ended: {}", e),
            }

            if *shutdown.borrow() || !self.inner.config.reconnect {
                break;
            }

            let delay = self.inner.config.reconnect_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = signalled(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }

        self.set_state(ConnectionState::Stopped);
        tracing::info!("S2 connection stopped");
    }

    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Connecting via {}", self.inner.medium.name());
        tokio::select! {
            connected = self.inner.medium.connect() => connected?,
            _ = signalled(shutdown) => return Ok(()),
        }

        let (session, mut terminated) = watch::channel(false);
        let session = Arc::new(session);
        *lock(&self.inner.session) = Some(session.clone());
        let number = self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;

        let (queue_tx, queue_rx) = mpsc::channel(self.inner.config.dispatch_queue_capacity.max(1));
        let mut receiver = tokio::spawn(self.clone().receive_loop(queue_tx));
        let mut dispatcher = tokio::spawn(self.clone().dispatch_loop(queue_rx));
        self.set_state(ConnectionState::Active);
        tracing::info!("S2 session {} active", number);
        let starter = tokio::spawn(self.clone().run_start_hooks());

        let end = tokio::select! {
            _ = signalled(shutdown) => SessionEnd::Shutdown,
            _ = signalled(&mut terminated) => SessionEnd::Terminated,
            r = &mut receiver => SessionEnd::Receiver(r),
            r = &mut dispatcher => SessionEnd::Dispatcher(r),
        };

        // Callers still waiting on acknowledgments can never be answered now.
        session.send_replace(true);
        if *shutdown.borrow() || !self.inner.config.reconnect {
            self.set_state(ConnectionState::Stopping);
        }

        starter.abort();
        settle("session start", starter).await;

        // A handle that already completed inside the select must not be polled again.
        let (receiver_done, dispatcher_done, outcome) = match end {
            SessionEnd::Shutdown => (false, false, Ok(())),
            SessionEnd::Terminated => (false, false, Err(S2Error::ConnectionTerminated)),
            SessionEnd::Receiver(r) => (true, false, flatten(r)),
            SessionEnd::Dispatcher(r) => (false, true, flatten(r)),
        };

        if !dispatcher_done {
            dispatcher.abort();
            settle("dispatch loop", dispatcher).await;
        }

        self.run_end_hooks().await;

        if !receiver_done {
            receiver.abort();
            settle("receive loop", receiver).await;
        }

        lock(&self.inner.session).take();
        self.inner.awaiter.clear();
        if let Err(e) = self.inner.medium.close().await {
            tracing::debug!("Closing {} failed: {}", self.inner.medium.name(), e);
        }

        outcome
    }

    /// Reads frames until the medium closes.
    ///
    /// Statuses go to the awaiter as soon as they are read. Other messages
    /// wait in `backlog` while the dispatch queue is full, so handlers
    /// awaiting an acknowledgment never starve the reader.
    async fn receive_loop(self, queue: mpsc::Sender<Message>) -> Result<()> {
        let mut backlog = VecDeque::new();

        loop {
            tokio::select! {
                raw = self.inner.medium.receive() => {
                    if let Some(message) = self.route_frame(&raw?).await? {
                        backlog.push_back(message);
                        if backlog.len() == self.inner.config.dispatch_queue_capacity {
                            tracing::warn!("Dispatch queue full, buffering inbound messages");
                        }
                    }
                },
                permit = queue.reserve(), if !backlog.is_empty() => {
                    let Ok(permit) = permit else {
                        return Ok(());
                    };
                    if let Some(message) = backlog.pop_front() {
                        permit.send(message);
                    }
                },
            }
        }
    }

    /// Answer undecodable frames and hand statuses to the awaiter.
    ///
    /// Returns the message if it is for the dispatch loop.
    async fn route_frame(&self, raw: &str) -> Result<Option<Message>> {
        let message = match self.inner.parser.parse_any(raw) {
            Ok(message) => message,
            Err(e) => {
                match e.reception_status() {
                    Some(status) => {
                        tracing::warn!("Rejecting inbound frame with {:?}: {}", status.status, e);
                        self.send_reception_status(status).await?;
                    },
                    None => tracing::warn!("Dropping inbound frame: {}", e),
                }
                return Ok(None);
            },
        };

        if message.is_reception_status() {
            match message.decode::<ReceptionStatus>() {
                Ok(status) => {
                    if let Err(e) = self.inner.awaiter.deliver(status) {
                        tracing::error!("{}", e);
                        return Err(e);
                    }
                },
                Err(e) => tracing::warn!("Dropping malformed reception status: {}", e),
            }
            return Ok(None);
        }

        tracing::debug!(
            "Received {} {:?}",
            message.message_type(),
            message.message_id()
        );
        Ok(Some(message))
    }

    async fn dispatch_loop(self, mut queue: mpsc::Receiver<Message>) -> Result<()> {
        while let Some(message) = queue.recv().await {
            if let Err(e) = self.inner.registry.dispatch(&self, message).await {
                tracing::error!("{}", e);
            }
        }
        Ok(())
    }

    async fn run_start_hooks(self) {
        for hooks in self.hooks() {
            if let Err(e) = hooks.on_session_start(self.clone()).await {
                tracing::error!("Session start failed: {}", e);
                self.request_restart("session start failed");
                return;
            }
        }
    }

    async fn run_end_hooks(&self) {
        for hooks in self.hooks() {
            if let Err(e) = hooks.on_session_end(self.clone()).await {
                tracing::warn!("Session end hook failed: {}", e);
            }
        }
    }

    fn hooks(&self) -> Vec<Arc<dyn SessionHooks>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("medium", &self.inner.medium.name())
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the watched flag is set (or its sender is gone).
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(S2Error::IllegalState(format!("session task failed: {e}"))),
    }
}

async fn settle<T>(name: &str, handle: JoinHandle<T>) {
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            tracing::error!("{} task failed: {}", name, e);
        }
    }
}
