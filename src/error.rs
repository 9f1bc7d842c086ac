//! S2 connection error types.
//!
//! Errors fall into the families the engine treats differently:
//!
//! - **Transport** (`MediumClosed`, `MediumCouldNotConnect`): end the current
//!   session and hand control to the reconnect supervisor.
//! - **Inbound payload** (`Decode`, `Validation`): answered locally with a
//!   synthesized `ReceptionStatus`, never surfaced to handlers.
//! - **Acknowledgment** (`AckTimeout`, `AckRejected`, `ProtocolViolation`):
//!   returned to the caller that is waiting on the outcome.
//! - **Handler** (`HandlerFailure`): converted to a `PERMANENT_ERROR`
//!   acknowledgment when possible, then logged by the dispatch loop.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ReceptionStatus, ReceptionStatusValues};

/// S2 protocol errors.
#[derive(Error, Debug)]
pub enum S2Error {
    /// The medium was closed by the peer or locally.
    #[error("Medium closed")]
    MediumClosed,

    /// The medium could not establish a connection.
    #[error("Medium could not connect: {0}")]
    MediumCouldNotConnect(String),

    /// Inbound frame is not valid JSON.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Inbound frame is JSON but violates the message schema.
    #[error("Validation error: {reason}")]
    Validation {
        /// Message id recovered from the frame, if any.
        message_id: Option<Uuid>,
        /// What was wrong with the frame.
        reason: String,
    },

    /// The peer broke a protocol rule (e.g. acknowledged a message twice).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No acknowledgment arrived within the caller's budget.
    #[error("No reception status for {message_id} within {timeout:?}")]
    AckTimeout {
        /// Id of the unacknowledged message.
        message_id: Uuid,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// The peer acknowledged with a non-OK status.
    #[error("Message {} rejected with {:?}", .0.subject_message_id, .0.status)]
    AckRejected(ReceptionStatus),

    /// The session ended while a caller was waiting on it.
    #[error("Connection terminated")]
    ConnectionTerminated,

    /// A message handler returned an error or panicked.
    #[error("Handler for {message_type} failed: {reason}")]
    HandlerFailure {
        /// Type tag of the message being handled.
        message_type: String,
        /// Failure description.
        reason: String,
    },

    /// An operation was invoked in a state that does not allow it.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised by device-specific code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for S2 operations
pub type Result<T> = std::result::Result<T, S2Error>;

impl S2Error {
    /// Whether this error originates in the transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::MediumClosed | Self::MediumCouldNotConnect(_))
    }

    /// The acknowledgment to send back for an inbound frame that failed to parse.
    ///
    /// Returns `None` for errors that are not about an inbound payload.
    pub fn reception_status(&self) -> Option<ReceptionStatus> {
        match self {
            Self::Decode(reason) => Some(ReceptionStatus::new(
                Uuid::nil(),
                ReceptionStatusValues::InvalidData,
                Some(reason.clone()),
            )),
            Self::Validation {
                message_id: Some(id),
                reason,
            } => Some(ReceptionStatus::new(
                *id,
                ReceptionStatusValues::InvalidMessage,
                Some(reason.clone()),
            )),
            Self::Validation {
                message_id: None,
                reason,
            } => Some(ReceptionStatus::new(
                Uuid::nil(),
                ReceptionStatusValues::InvalidData,
                Some(reason.clone()),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_maps_to_invalid_data_with_nil_subject() {
        let status = S2Error::Decode("expected value".to_string())
            .reception_status()
            .unwrap();
        assert_eq!(status.subject_message_id, Uuid::nil());
        assert_eq!(status.status, ReceptionStatusValues::InvalidData);
    }

    #[test]
    fn test_validation_error_with_id_maps_to_invalid_message() {
        let id = Uuid::new_v4();
        let status = S2Error::Validation {
            message_id: Some(id),
            reason: "missing role".to_string(),
        }
        .reception_status()
        .unwrap();
        assert_eq!(status.subject_message_id, id);
        assert_eq!(status.status, ReceptionStatusValues::InvalidMessage);
    }

    #[test]
    fn test_validation_error_without_id_maps_to_invalid_data() {
        let status = S2Error::Validation {
            message_id: None,
            reason: "missing message_type".to_string(),
        }
        .reception_status()
        .unwrap();
        assert_eq!(status.subject_message_id, Uuid::nil());
        assert_eq!(status.status, ReceptionStatusValues::InvalidData);
    }

    #[test]
    fn test_transport_classification() {
        assert!(S2Error::MediumClosed.is_transport());
        assert!(S2Error::MediumCouldNotConnect("refused".into()).is_transport());
        assert!(!S2Error::ConnectionTerminated.is_transport());
        assert!(S2Error::ConnectionTerminated.reception_status().is_none());
    }
}
