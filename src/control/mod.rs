//! Control types and the Resource Manager lifecycle.
//!
//! A control type is the protocol a CEM uses to steer a device once the
//! session is negotiated. The Resource Manager offers a set of them in
//! `ResourceManagerDetails`; the CEM picks one with `SelectControlType`.
//!
//! | Tag                            | Implementation                  | Instruction messages              |
//! |--------------------------------|---------------------------------|-----------------------------------|
//! | `NOT_CONTROLABLE`              | [`NoControl`]                   | none                              |
//! | `FILL_RATE_BASED_CONTROL`      | [`InstructionControl::frbc`]    | `FRBC.Instruction`                |
//! | `OPERATION_MODE_BASED_CONTROL` | [`InstructionControl::ombc`]    | `OMBC.Instruction`                |
//! | `POWER_ENVELOPE_BASED_CONTROL` | [`InstructionControl::pebc`]    | `PEBC.Instruction`                |
//! | `POWER_PROFILE_BASED_CONTROL`  | [`InstructionControl::ppbc`]    | `PPBC.*Instruction` (three types) |
//! | `DEMAND_DRIVEN_BASED_CONTROL`  | [`InstructionControl::ddbc`]    | `DDBC.Instruction`                |
//!
//! At most one control type is registered on a connection at a time; the
//! [`ResourceManagerHandler`] deactivates and unregisters the previous one
//! before wiring in the next.

mod resource_manager;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::connection::{AckCapsule, Connection, MessageHandler};
use crate::error::Result;
use crate::protocol::{ControlTypeTag, Message};

pub use resource_manager::ResourceManagerHandler;

/// One control protocol the Resource Manager can be switched to.
pub trait ControlType: Send + Sync {
    /// Tag announced in `ResourceManagerDetails` and matched on selection
    fn protocol_tag(&self) -> ControlTypeTag;

    /// Wire this control type's message handlers onto `conn`.
    fn register_handlers(self: Arc<Self>, conn: &Connection);

    /// Remove the handlers added by [`register_handlers`](Self::register_handlers).
    fn unregister_handlers(&self, conn: &Connection) {
        for message_type in self.protocol_tag().instruction_types() {
            conn.unregister_handler(message_type);
        }
    }

    /// Called once the CEM selected this control type.
    fn activate(&self, conn: Connection) -> BoxFuture<'_, Result<()>>;

    /// Called when another control type is selected or the session ends.
    fn deactivate(&self, conn: Connection) -> BoxFuture<'_, Result<()>>;
}

/// Control type for devices that cannot be steered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoControl;

impl ControlType for NoControl {
    fn protocol_tag(&self) -> ControlTypeTag {
        ControlTypeTag::NotControlable
    }

    fn register_handlers(self: Arc<Self>, _conn: &Connection) {}

    fn activate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
        tracing::info!("Device is not controllable");
        Box::pin(async { Ok(()) })
    }

    fn deactivate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Device-specific behavior behind an [`InstructionControl`].
pub trait ControlDevice: Send + Sync {
    /// Carry out one instruction.
    ///
    /// Returning `Ok` without using `ack` acknowledges with `OK`; returning
    /// `Err` acknowledges with `PERMANENT_ERROR`.
    fn handle_instruction(
        &self,
        conn: Connection,
        instruction: Message,
        ack: AckCapsule,
    ) -> BoxFuture<'_, Result<()>>;

    /// Called when the control type becomes active, e.g. to send system
    /// descriptions.
    fn on_activate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Called when the control type stops being active.
    fn on_deactivate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Instruction-driven control type backed by a [`ControlDevice`].
pub struct InstructionControl {
    tag: ControlTypeTag,
    device: Arc<dyn ControlDevice>,
}

impl InstructionControl {
    /// Build the control type for `tag`.
    ///
    /// Returns `None` for tags without instruction messages.
    pub fn for_tag(tag: ControlTypeTag, device: Arc<dyn ControlDevice>) -> Option<Self> {
        if tag.instruction_types().is_empty() {
            return None;
        }
        Some(Self { tag, device })
    }

    /// Fill-rate-based control
    pub fn frbc(device: Arc<dyn ControlDevice>) -> Self {
        Self {
            tag: ControlTypeTag::FillRateBasedControl,
            device,
        }
    }

    /// Operation-mode-based control
    pub fn ombc(device: Arc<dyn ControlDevice>) -> Self {
        Self {
            tag: ControlTypeTag::OperationModeBasedControl,
            device,
        }
    }

    /// Power-envelope-based control
    pub fn pebc(device: Arc<dyn ControlDevice>) -> Self {
        Self {
            tag: ControlTypeTag::PowerEnvelopeBasedControl,
            device,
        }
    }

    /// Power-profile-based control
    pub fn ppbc(device: Arc<dyn ControlDevice>) -> Self {
        Self {
            tag: ControlTypeTag::PowerProfileBasedControl,
            device,
        }
    }

    /// Demand-driven-based control
    pub fn ddbc(device: Arc<dyn ControlDevice>) -> Self {
        Self {
            tag: ControlTypeTag::DemandDrivenBasedControl,
            device,
        }
    }
}

impl ControlType for InstructionControl {
    fn protocol_tag(&self) -> ControlTypeTag {
        self.tag
    }

    fn register_handlers(self: Arc<Self>, conn: &Connection) {
        for message_type in self.tag.instruction_types() {
            conn.register_handler(
                *message_type,
                Arc::new(InstructionHandler(self.device.clone())),
            );
        }
    }

    fn activate(&self, conn: Connection) -> BoxFuture<'_, Result<()>> {
        self.device.on_activate(conn)
    }

    fn deactivate(&self, conn: Connection) -> BoxFuture<'_, Result<()>> {
        self.device.on_deactivate(conn)
    }
}

struct InstructionHandler(Arc<dyn ControlDevice>);

impl MessageHandler for InstructionHandler {
    fn handle(
        &self,
        conn: Connection,
        message: Message,
        ack: AckCapsule,
    ) -> BoxFuture<'static, Result<()>> {
        let device = self.0.clone();
        Box::pin(async move { device.handle_instruction(conn, message, ack).await })
    }
}
