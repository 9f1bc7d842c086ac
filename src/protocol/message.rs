//! Opaque message envelope.
//!
//! The engine routes on two fields only: the `message_type` discriminator and,
//! when present, the `message_id`. Everything else in the JSON object is
//! carried untouched for the handler to decode.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::types::ReceptionStatus;
use crate::error::{Result, S2Error};

/// A typed S2 message that can be wrapped in a [`Message`] envelope.
pub trait S2Message: Serialize + DeserializeOwned {
    /// Wire discriminator (`message_type` field).
    const MESSAGE_TYPE: &'static str;

    /// Message id, if this message type carries one.
    fn message_id(&self) -> Option<Uuid>;
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: String,
    message_id: Option<Uuid>,
    payload: Value,
}

impl Message {
    /// Wrap a decoded JSON object.
    ///
    /// Fails with [`S2Error::Validation`] if the object has no string
    /// `message_type`, or carries a `message_id` that is not a UUID.
    pub fn from_value(payload: Value) -> Result<Self> {
        let Some(object) = payload.as_object() else {
            return Err(S2Error::Validation {
                message_id: None,
                reason: "message is not a JSON object".to_string(),
            });
        };

        let message_id = match object.get("message_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => {
                Some(Uuid::parse_str(raw).map_err(|e| S2Error::Validation {
                    message_id: None,
                    reason: format!("message_id is not a UUID: {e}"),
                })?)
            },
            Some(_) => {
                return Err(S2Error::Validation {
                    message_id: None,
                    reason: "message_id is not a string".to_string(),
                })
            },
        };

        let message_type = object
            .get("message_type")
            .and_then(Value::as_str)
            .ok_or_else(|| S2Error::Validation {
                message_id,
                reason: "missing message_type".to_string(),
            })?
            .to_string();

        Ok(Self {
            message_type,
            message_id,
            payload,
        })
    }

    /// Wrap a typed message.
    pub fn from_typed<T: S2Message>(message: &T) -> Result<Self> {
        let mut payload = serde_json::to_value(message)?;
        if let Some(object) = payload.as_object_mut() {
            object
                .entry("message_type")
                .or_insert_with(|| Value::String(T::MESSAGE_TYPE.to_string()));
        }
        Self::from_value(payload)
    }

    /// Message type tag
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Message id, if the message carries one
    pub fn message_id(&self) -> Option<Uuid> {
        self.message_id
    }

    /// Whether this message is an acknowledgment
    pub fn is_reception_status(&self) -> bool {
        self.message_type == ReceptionStatus::MESSAGE_TYPE
    }

    /// Full JSON object
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|e| S2Error::Validation {
            message_id: self.message_id,
            reason: e.to_string(),
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}
