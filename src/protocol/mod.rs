//! S2 message model.
//!
//! Every frame on the wire is a JSON object with a `message_type`
//! discriminator. Most messages also carry a `message_id` (UUID) and must be
//! acknowledged by the receiver with exactly one `ReceptionStatus` whose
//! `subject_message_id` points back at them.
//!
//! ## Message Flow (RM side)
//!
//! ```text
//! RM                                 CEM
//!  |                                  |
//!  |------ Handshake (RM) ---------->|
//!  |<----- ReceptionStatus ----------|
//!  |<----- Handshake (CEM) ----------|
//!  |------ ReceptionStatus --------->|
//!  |<----- HandshakeResponse --------|
//!  |------ ReceptionStatus --------->|
//!  |------ ResourceManagerDetails -->|
//!  |<----- ReceptionStatus ----------|
//!  |<----- SelectControlType --------|
//!  |------ ReceptionStatus --------->|
//!  |                                  |
//!  |<===== FRBC.Instruction ... =====|  control-type specific traffic
//! ```
//!
//! The engine only needs the envelope ([`Message`]); the typed structs in
//! this module cover the messages it produces or consumes itself.

mod message;
mod parser;
mod types;

pub use message::{Message, S2Message};
pub use parser::{JsonParser, Parser};
pub use types::{
    Commodity, ControlTypeTag, EnergyManagementRole, Handshake, HandshakeResponse,
    ReceptionStatus, ReceptionStatusValues, ResourceManagerDetails, Role, RoleType,
    SelectControlType, SessionRequest, SessionRequestType,
};

/// S2 protocol version spoken by this crate
pub const PROTOCOL_VERSION: &str = "0.0.2-beta";
