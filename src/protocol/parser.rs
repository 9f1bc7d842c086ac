//! Inbound frame parsing.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::message::{Message, S2Message};
use super::types::{
    Handshake, HandshakeResponse, ReceptionStatus, ResourceManagerDetails, SelectControlType,
    SessionRequest,
};
use crate::error::{Result, S2Error};

/// Decodes raw text frames into messages.
pub trait Parser: Send + Sync {
    /// Read only the type tag of a frame.
    ///
    /// Returns `Ok(None)` when the frame is JSON but has no `message_type`.
    fn parse_type(&self, raw: &str) -> Result<Option<String>>;

    /// Decode and validate a frame.
    ///
    /// Fails with [`S2Error::Decode`] for malformed JSON and
    /// [`S2Error::Validation`] for schema violations.
    fn parse_any(&self, raw: &str) -> Result<Message>;
}

type Validator = fn(&Value) -> std::result::Result<(), serde_json::Error>;

fn validate<T: S2Message>(value: &Value) -> std::result::Result<(), serde_json::Error> {
    T::deserialize(value).map(|_| ())
}

/// JSON parser that schema-checks the core message types.
///
/// Types without a registered validator (control-type payloads) are accepted
/// as long as the envelope is well-formed.
#[derive(Clone)]
pub struct JsonParser {
    validators: HashMap<&'static str, Validator>,
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonParser {
    /// Create a parser that validates the core message set
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
        }
        .with_validator::<ReceptionStatus>()
        .with_validator::<Handshake>()
        .with_validator::<HandshakeResponse>()
        .with_validator::<ResourceManagerDetails>()
        .with_validator::<SelectControlType>()
        .with_validator::<SessionRequest>()
    }

    /// Validate frames of type `T` against its schema
    pub fn with_validator<T: S2Message>(mut self) -> Self {
        self.validators.insert(T::MESSAGE_TYPE, validate::<T>);
        self
    }

    /// Check if a message type has a schema
    pub fn validates(&self, message_type: &str) -> bool {
        self.validators.contains_key(message_type)
    }

    fn decode(raw: &str) -> Result<Value> {
        serde_json::from_str(raw).map_err(|e| S2Error::Decode(e.to_string()))
    }
}

impl Parser for JsonParser {
    fn parse_type(&self, raw: &str) -> Result<Option<String>> {
        let value = Self::decode(raw)?;
        Ok(value
            .get("message_type")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn parse_any(&self, raw: &str) -> Result<Message> {
        let message = Message::from_value(Self::decode(raw)?)?;

        if let Some(validator) = self.validators.get(message.message_type()) {
            validator(message.payload()).map_err(|e| S2Error::Validation {
                message_id: message.message_id(),
                reason: format!("invalid {}: {e}", message.message_type()),
            })?;
        }

        Ok(message)
    }
}
