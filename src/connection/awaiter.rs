//! Correlation of outbound messages with their acknowledgments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, S2Error};
use crate::protocol::ReceptionStatus;

/// Consumed ids remembered for duplicate detection.
const ANSWERED_HISTORY: usize = 4096;

enum Slot {
    /// Callers suspended on this id.
    Waiting(Vec<oneshot::Sender<ReceptionStatus>>),
    /// Status arrived before anyone asked for it.
    Delivered(ReceptionStatus),
}

#[derive(Default)]
struct Slots {
    pending: HashMap<Uuid, Slot>,
    answered: HashSet<Uuid>,
    answered_order: VecDeque<Uuid>,
}

impl Slots {
    fn mark_answered(&mut self, message_id: Uuid) {
        if !self.answered.insert(message_id) {
            return;
        }
        self.answered_order.push_back(message_id);
        if self.answered_order.len() > ANSWERED_HISTORY {
            if let Some(oldest) = self.answered_order.pop_front() {
                self.answered.remove(&oldest);
            }
        }
    }
}

/// Matches `ReceptionStatus` messages to the callers waiting for them.
///
/// At most one status is accepted per message id, whether or not it was
/// already consumed; a second one is a protocol violation on the peer's side.
/// Consumed ids are remembered until [`clear`](Self::clear) (bounded by the
/// most recent 4096).
#[derive(Default)]
pub struct ReceptionStatusAwaiter {
    slots: Mutex<Slots>,
}

impl ReceptionStatusAwaiter {
    /// Create an empty awaiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the acknowledgment of `message_id`.
    ///
    /// Returns a cached status immediately if it already arrived. Fails with
    /// [`S2Error::AckTimeout`] when `timeout` elapses; a status arriving after
    /// that is cached for the next caller.
    pub async fn wait_for(&self, message_id: Uuid, timeout: Duration) -> Result<ReceptionStatus> {
        let rx = {
            let mut slots = self.lock();
            match slots.pending.remove(&message_id) {
                Some(Slot::Delivered(status)) => {
                    slots.mark_answered(message_id);
                    return Ok(status);
                },
                Some(Slot::Waiting(mut waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    slots.pending.insert(message_id, Slot::Waiting(waiters));
                    rx
                },
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.pending.insert(message_id, Slot::Waiting(vec![tx]));
                    rx
                },
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(S2Error::ConnectionTerminated),
            Err(_) => {
                self.forget_abandoned(message_id);
                Err(S2Error::AckTimeout {
                    message_id,
                    timeout,
                })
            },
        }
    }

    /// Hand an inbound status to whoever waits for it.
    ///
    /// Fails with [`S2Error::ProtocolViolation`] if a status for the same id
    /// was already delivered, consumed or not.
    pub fn deliver(&self, status: ReceptionStatus) -> Result<()> {
        let message_id = status.subject_message_id;
        let mut slots = self.lock();

        if slots.answered.contains(&message_id) {
            return Err(duplicate(message_id));
        }

        match slots.pending.remove(&message_id) {
            Some(Slot::Delivered(previous)) => {
                slots.pending.insert(message_id, Slot::Delivered(previous));
                Err(duplicate(message_id))
            },
            Some(Slot::Waiting(waiters)) => {
                let mut resolved = 0;
                for waiter in waiters {
                    if waiter.send(status.clone()).is_ok() {
                        resolved += 1;
                    }
                }
                if resolved == 0 {
                    slots.pending.insert(message_id, Slot::Delivered(status));
                } else {
                    slots.mark_answered(message_id);
                }
                Ok(())
            },
            None => {
                slots.pending.insert(message_id, Slot::Delivered(status));
                Ok(())
            },
        }
    }

    /// Number of ids with waiters or unconsumed statuses.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drop every waiter, cached status and answered id.
    ///
    /// Suspended callers fail with [`S2Error::ConnectionTerminated`].
    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.pending.clear();
        slots.answered.clear();
        slots.answered_order.clear();
    }

    fn forget_abandoned(&self, message_id: Uuid) {
        let mut slots = self.lock();
        if let Some(Slot::Waiting(waiters)) = slots.pending.get_mut(&message_id) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                slots.pending.remove(&message_id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn duplicate(message_id: Uuid) -> S2Error {
    S2Error::ProtocolViolation(format!(
        "duplicate reception status for message {message_id}"
    ))
}
