//! Handler registry and the acknowledgment guarantee.
//!
//! Every inbound message that carries a `message_id` gets exactly one
//! `ReceptionStatus`, whatever its handler does:
//!
//! | Handler outcome                 | Acknowledgment sent          |
//! |---------------------------------|------------------------------|
//! | calls [`AckCapsule::send`]      | the one it sent              |
//! | returns `Ok` without acking     | `OK` (with a warning)        |
//! | returns `Err` or panics         | `PERMANENT_ERROR`            |

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use super::engine::Connection;
use crate::error::{Result, S2Error};
use crate::protocol::{Message, ReceptionStatus, ReceptionStatusValues};

/// Handles one inbound message type.
///
/// Handlers may suspend (e.g. to send and await their own messages); the
/// dispatch loop waits for them before taking the next message.
pub trait MessageHandler: Send + Sync {
    /// Process `message`, acknowledging it through `ack`.
    fn handle(&self, conn: Connection, message: Message, ack: AckCapsule)
        -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Connection, Message, AckCapsule) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        conn: Connection,
        message: Message,
        ack: AckCapsule,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(conn, message, ack))
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Connection, Message, AckCapsule) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(f)
}

/// Single-use acknowledgment bound to one inbound message.
///
/// Clones share the "sent" flag, so the dispatcher can tell whether the
/// handler acknowledged.
#[derive(Clone)]
pub struct AckCapsule {
    conn: Connection,
    subject: Option<Uuid>,
    sent: Arc<AtomicBool>,
}

impl AckCapsule {
    pub(crate) fn new(conn: Connection, subject: Option<Uuid>) -> Self {
        Self {
            conn,
            subject,
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Id of the message this capsule acknowledges.
    pub fn subject(&self) -> Option<Uuid> {
        self.subject
    }

    /// Whether an acknowledgment went out through this capsule.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Acknowledge with `status`. Only the first call sends anything.
    pub async fn send(
        &self,
        status: ReceptionStatusValues,
        diagnostic_label: Option<String>,
    ) -> Result<()> {
        let Some(subject) = self.subject else {
            return Ok(());
        };
        if self.sent.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reception status for {} already sent", subject);
            return Ok(());
        }

        self.conn
            .send_reception_status(ReceptionStatus::new(subject, status, diagnostic_label))
            .await
    }

    /// Acknowledge with `OK`.
    pub async fn ok(&self) -> Result<()> {
        self.send(ReceptionStatusValues::Ok, None).await
    }
}

/// Maps message types to handlers. Last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let message_type = message_type.into();
        tracing::debug!("Registered handler for {}", message_type);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type, handler);
    }

    /// Remove the handler for `message_type`, if any.
    pub fn unregister(&self, message_type: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(message_type);
    }

    /// Check if a handler is registered
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_type)
    }

    fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }

    /// Run the handler for `message` and guarantee its acknowledgment.
    ///
    /// Messages without a handler are dropped. Returns
    /// [`S2Error::HandlerFailure`] after the fallback `PERMANENT_ERROR`
    /// acknowledgment if the handler failed.
    pub async fn dispatch(&self, conn: &Connection, message: Message) -> Result<()> {
        let message_type = message.message_type().to_string();
        let Some(handler) = self.get(&message_type) else {
            tracing::debug!("No handler registered for {}, dropping", message_type);
            return Ok(());
        };

        let subject = message.message_id();
        let ack = AckCapsule::new(conn.clone(), subject);
        let outcome = AssertUnwindSafe(handler.handle(conn.clone(), message, ack.clone()))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        match failure {
            None => {
                if subject.is_some() && !ack.is_sent() {
                    tracing::warn!(
                        "Handler for {} did not acknowledge {:?}, sending OK",
                        message_type,
                        subject
                    );
                    ack.ok().await?;
                }
                Ok(())
            },
            Some(reason) => {
                if subject.is_some() && !ack.is_sent() {
                    if let Err(e) = ack
                        .send(ReceptionStatusValues::PermanentError, Some(reason.clone()))
                        .await
                    {
                        tracing::warn!(
                            "Could not send PERMANENT_ERROR for {:?}: {}",
                            subject,
                            e
                        );
                    }
                }
                Err(S2Error::HandlerFailure {
                    message_type,
                    reason,
                })
            },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
