//! Typed core messages.
//!
//! Only the messages the connection engine and the Resource Manager lifecycle
//! produce or consume are typed here. Control-type payloads such as
//! `FRBC.Instruction` stay opaque and are decoded by device code.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::S2Message;

/// Role of a peer in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnergyManagementRole {
    /// Customer Energy Manager
    Cem,
    /// Resource Manager
    Rm,
}

/// Control protocol the CEM can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlTypeTag {
    /// PEBC
    PowerEnvelopeBasedControl,
    /// PPBC
    PowerProfileBasedControl,
    /// OMBC
    OperationModeBasedControl,
    /// FRBC
    FillRateBasedControl,
    /// DDBC
    DemandDrivenBasedControl,
    /// Device offers no control
    NotControlable,
    /// CEM has not selected anything yet
    NoSelection,
}

impl ControlTypeTag {
    /// Inbound instruction message types governed by this control type.
    pub fn instruction_types(&self) -> &'static [&'static str] {
        match self {
            Self::PowerEnvelopeBasedControl => &["PEBC.Instruction"],
            Self::PowerProfileBasedControl => &[
                "PPBC.ScheduleInstruction",
                "PPBC.StartInterruptionInstruction",
                "PPBC.EndInterruptionInstruction",
            ],
            Self::OperationModeBasedControl => &["OMBC.Instruction"],
            Self::FillRateBasedControl => &["FRBC.Instruction"],
            Self::DemandDrivenBasedControl => &["DDBC.Instruction"],
            Self::NotControlable | Self::NoSelection => &[],
        }
    }
}

/// Acknowledgment outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceptionStatusValues {
    /// Message accepted
    Ok,
    /// Frame could not be decoded
    InvalidData,
    /// Frame decoded but violates the schema
    InvalidMessage,
    /// Message is well-formed but its content is not acceptable
    InvalidContent,
    /// Receiver could not process the message right now
    TemporaryError,
    /// Receiver will never process the message
    PermanentError,
}

/// Acknowledgment of a message carrying a `message_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceptionStatus {
    /// Id of the acknowledged message
    pub subject_message_id: Uuid,
    /// Outcome
    pub status: ReceptionStatusValues,
    /// Optional human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_label: Option<String>,
}

impl ReceptionStatus {
    /// Create a reception status
    pub fn new(
        subject_message_id: Uuid,
        status: ReceptionStatusValues,
        diagnostic_label: Option<String>,
    ) -> Self {
        Self {
            subject_message_id,
            status,
            diagnostic_label,
        }
    }

    /// Create an OK reception status
    pub fn ok(subject_message_id: Uuid) -> Self {
        Self::new(subject_message_id, ReceptionStatusValues::Ok, None)
    }

    /// Check if the status is OK
    pub fn is_ok(&self) -> bool {
        self.status == ReceptionStatusValues::Ok
    }
}

impl S2Message for ReceptionStatus {
    const MESSAGE_TYPE: &'static str = "ReceptionStatus";

    fn message_id(&self) -> Option<Uuid> {
        None
    }
}

/// Capability announcement that opens a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Message id
    pub message_id: Uuid,
    /// Sender role
    pub role: EnergyManagementRole,
    /// Protocol versions the sender speaks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_protocol_versions: Option<Vec<String>>,
}

impl Handshake {
    /// Create a handshake with a fresh message id
    pub fn new(role: EnergyManagementRole, supported_protocol_versions: Vec<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            role,
            supported_protocol_versions: Some(supported_protocol_versions),
        }
    }
}

impl S2Message for Handshake {
    const MESSAGE_TYPE: &'static str = "Handshake";

    fn message_id(&self) -> Option<Uuid> {
        Some(self.message_id)
    }
}

/// CEM's answer to a handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Message id
    pub message_id: Uuid,
    /// Version the CEM picked
    pub selected_protocol_version: String,
}

impl HandshakeResponse {
    /// Create a handshake response with a fresh message id
    pub fn new(selected_protocol_version: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            selected_protocol_version: selected_protocol_version.into(),
        }
    }
}

impl S2Message for HandshakeResponse {
    const MESSAGE_TYPE: &'static str = "HandshakeResponse";

    fn message_id(&self) -> Option<Uuid> {
        Some(self.message_id)
    }
}

/// Energy role of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleType {
    /// Produces energy
    EnergyProducer,
    /// Consumes energy
    EnergyConsumer,
    /// Stores energy
    EnergyStorage,
}

/// Energy carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Commodity {
    /// Gas
    Gas,
    /// Heat
    Heat,
    /// Electricity
    Electricity,
    /// Oil
    Oil,
}

/// Role a resource plays for one commodity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role type
    pub role: RoleType,
    /// Commodity the role applies to
    pub commodity: Commodity,
}

/// Device description sent by the RM after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceManagerDetails {
    /// Message id
    pub message_id: Uuid,
    /// Stable resource identifier
    pub resource_id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Roles of the resource
    pub roles: Vec<Role>,
    /// Manufacturer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Milliseconds between receiving an instruction and acting on it
    pub instruction_processing_delay: u64,
    /// Control types the RM can be switched to
    pub available_control_types: Vec<ControlTypeTag>,
    /// Currency for any cost figures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Whether the RM sends forecasts
    pub provides_forecast: bool,
    /// Commodity quantities the RM measures
    #[serde(default)]
    pub provides_power_measurement_types: Vec<String>,
}

impl S2Message for ResourceManagerDetails {
    const MESSAGE_TYPE: &'static str = "ResourceManagerDetails";

    fn message_id(&self) -> Option<Uuid> {
        Some(self.message_id)
    }
}

/// CEM's choice of control protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectControlType {
    /// Message id
    pub message_id: Uuid,
    /// Selected control type
    pub control_type: ControlTypeTag,
}

impl SelectControlType {
    /// Create a selection with a fresh message id
    pub fn new(control_type: ControlTypeTag) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            control_type,
        }
    }
}

impl S2Message for SelectControlType {
    const MESSAGE_TYPE: &'static str = "SelectControlType";

    fn message_id(&self) -> Option<Uuid> {
        Some(self.message_id)
    }
}

/// What a session request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionRequestType {
    /// Drop the session and negotiate again
    Reconnect,
    /// End the connection for good
    Terminate,
}

/// Peer request to reconnect or terminate the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Message id
    pub message_id: Uuid,
    /// Requested action
    pub request: SessionRequestType,
    /// Optional human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_label: Option<String>,
}

impl SessionRequest {
    /// Create a session request with a fresh message id
    pub fn new(request: SessionRequestType) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            request,
            diagnostic_label: None,
        }
    }
}

impl S2Message for SessionRequest {
    const MESSAGE_TYPE: &'static str = "SessionRequest";

    fn message_id(&self) -> Option<Uuid> {
        Some(self.message_id)
    }
}
