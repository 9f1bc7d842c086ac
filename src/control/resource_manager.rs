//! Resource Manager side of session negotiation.
//!
//! ```text
//! RM                                   CEM
//!  │── Handshake ────────────────────────▶│   session start
//!  │◀──────────────────── HandshakeResponse│
//!  │── ResourceManagerDetails ───────────▶│
//!  │◀──────────────────── SelectControlType│   deactivate old, activate new
//!  │◀──────────────── <control messages> ──│
//! ```
//!
//! Every step waits for the peer's `ReceptionStatus`. The active control type
//! is dropped at session end; a reconnect negotiates from scratch.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;

use super::ControlType;
use crate::config::ResourceManagerConfig;
use crate::connection::{handler_fn, Connection, SessionHooks};
use crate::error::Result;
use crate::protocol::{
    ControlTypeTag, EnergyManagementRole, Handshake, HandshakeResponse, Message,
    ResourceManagerDetails, S2Message, SelectControlType, SessionRequest, SessionRequestType,
};

/// Handlers and session hooks implementing the RM protocol lifecycle.
pub struct ResourceManagerHandler {
    config: ResourceManagerConfig,
    control_types: Vec<Arc<dyn ControlType>>,
    active: Mutex<Option<Arc<dyn ControlType>>>,
}

impl ResourceManagerHandler {
    /// Create a handler offering no control types yet.
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self {
            config,
            control_types: Vec::new(),
            active: Mutex::new(None),
        }
    }

    /// Offer `control_type`, replacing any with the same tag.
    pub fn with_control_type(mut self, control_type: Arc<dyn ControlType>) -> Self {
        let tag = control_type.protocol_tag();
        self.control_types.retain(|c| c.protocol_tag() != tag);
        self.control_types.push(control_type);
        self
    }

    /// Tags offered to the CEM, in registration order
    pub fn available_control_types(&self) -> Vec<ControlTypeTag> {
        self.control_types.iter().map(|c| c.protocol_tag()).collect()
    }

    /// Tag of the currently active control type
    pub fn active_control_type(&self) -> Option<ControlTypeTag> {
        self.lock_active().as_ref().map(|c| c.protocol_tag())
    }

    /// Register the RM handlers and session hooks on `conn`.
    pub fn attach(self: Arc<Self>, conn: &Connection) {
        conn.register_handler(
            Handshake::MESSAGE_TYPE,
            handler_fn(|_conn, message, ack| async move {
                let handshake: Handshake = message.decode()?;
                tracing::debug!(
                    "Peer handshake as {:?}, versions {:?}",
                    handshake.role,
                    handshake.supported_protocol_versions
                );
                ack.ok().await
            }),
        );

        let rm = self.clone();
        conn.register_handler(
            HandshakeResponse::MESSAGE_TYPE,
            handler_fn(move |conn, message, ack| {
                let rm = rm.clone();
                async move {
                    let response: HandshakeResponse = message.decode()?;
                    ack.ok().await?;
                    tracing::info!(
                        "CEM selected protocol version {}",
                        response.selected_protocol_version
                    );
                    conn.send_and_await_ok(&Message::from_typed(&rm.details())?)
                        .await?;
                    Ok(())
                }
            }),
        );

        let rm = self.clone();
        conn.register_handler(
            SelectControlType::MESSAGE_TYPE,
            handler_fn(move |conn, message, ack| {
                let rm = rm.clone();
                async move {
                    let selection: SelectControlType = message.decode()?;
                    ack.ok().await?;
                    rm.select_control_type(&conn, selection.control_type).await
                }
            }),
        );

        conn.register_handler(
            SessionRequest::MESSAGE_TYPE,
            handler_fn(|conn, message, ack| async move {
                let request: SessionRequest = message.decode()?;
                ack.ok().await?;
                let reason = request
                    .diagnostic_label
                    .unwrap_or_else(|| "no reason given".to_string());
                match request.request {
                    SessionRequestType::Reconnect => {
                        conn.request_restart(&format!("peer requested reconnect: {reason}"));
                    },
                    SessionRequestType::Terminate => {
                        tracing::info!("Peer requested termination: {}", reason);
                        conn.request_stop();
                    },
                }
                Ok(())
            }),
        );

        conn.add_session_hooks(self);
    }

    /// `ResourceManagerDetails` built from the configuration.
    pub fn details(&self) -> ResourceManagerDetails {
        ResourceManagerDetails {
            message_id: uuid::Uuid::new_v4(),
            resource_id: self.config.resource_id.clone(),
            name: self.config.name.clone(),
            roles: self.config.roles.clone(),
            manufacturer: self.config.manufacturer.clone(),
            model: self.config.model.clone(),
            serial_number: self.config.serial_number.clone(),
            firmware_version: self.config.firmware_version.clone(),
            instruction_processing_delay: self.config.instruction_processing_delay_ms,
            available_control_types: self.available_control_types(),
            currency: self.config.currency.clone(),
            provides_forecast: self.config.provides_forecast,
            provides_power_measurement_types: self.config.provides_power_measurement_types.clone(),
        }
    }

    /// Switch to the control type tagged `tag`.
    ///
    /// The active control type is always deactivated first. An unknown tag
    /// leaves nothing active.
    pub async fn select_control_type(&self, conn: &Connection, tag: ControlTypeTag) -> Result<()> {
        self.deactivate_active(conn).await;

        let Some(next) = self
            .control_types
            .iter()
            .find(|c| c.protocol_tag() == tag)
            .cloned()
        else {
            tracing::warn!("No control type offered for {:?}", tag);
            return Ok(());
        };

        next.clone().register_handlers(conn);
        *self.lock_active() = Some(next.clone());

        if let Err(e) = next.activate(conn.clone()).await {
            next.unregister_handlers(conn);
            self.lock_active().take();
            return Err(e);
        }

        tracing::info!("Activated control type {:?}", tag);
        Ok(())
    }

    /// Deactivate and unregister the active control type, if any.
    pub async fn deactivate_active(&self, conn: &Connection) {
        let previous = self.lock_active().take();
        let Some(previous) = previous else {
            return;
        };

        let tag = previous.protocol_tag();
        if let Err(e) = previous.deactivate(conn.clone()).await {
            tracing::warn!("Deactivating {:?} failed: {}", tag, e);
        }
        previous.unregister_handlers(conn);
        tracing::info!("Deactivated control type {:?}", tag);
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ControlType>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionHooks for ResourceManagerHandler {
    fn on_session_start(&self, conn: Connection) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handshake = Handshake::new(
                EnergyManagementRole::Rm,
                self.config.supported_protocol_versions.clone(),
            );
            conn.send_and_await_ok(&Message::from_typed(&handshake)?)
                .await?;
            tracing::debug!("Handshake acknowledged");
            Ok(())
        })
    }

    fn on_session_end(&self, conn: Connection) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.deactivate_active(&conn).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::AckCapsule;
    use crate::control::{ControlDevice, InstructionControl, NoControl};
    use crate::medium::ChannelMedium;
    use crate::protocol::{Commodity, JsonParser, Role, RoleType};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct RecordingDevice {
        name: &'static str,
        recorder: Arc<Recorder>,
    }

    impl ControlDevice for RecordingDevice {
        fn handle_instruction(
            &self,
            _conn: Connection,
            _instruction: Message,
            _ack: AckCapsule,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn on_activate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
            self.recorder
                .events
                .lock()
                .unwrap()
                .push(format!("activate {}", self.name));
            Box::pin(async { Ok(()) })
        }

        fn on_deactivate(&self, _conn: Connection) -> BoxFuture<'_, Result<()>> {
            self.recorder
                .events
                .lock()
                .unwrap()
                .push(format!("deactivate {}", self.name));
            Box::pin(async { Ok(()) })
        }
    }

    fn idle_connection() -> Connection {
        let (medium, _peer) = ChannelMedium::new();
        Connection::new(ConnectionConfig::default(), medium, Arc::new(JsonParser::new()))
    }

    fn handler(recorder: &Arc<Recorder>) -> ResourceManagerHandler {
        ResourceManagerHandler::new(ResourceManagerConfig::default())
            .with_control_type(Arc::new(NoControl))
            .with_control_type(Arc::new(InstructionControl::frbc(Arc::new(RecordingDevice {
                name: "frbc",
                recorder: recorder.clone(),
            }))))
            .with_control_type(Arc::new(InstructionControl::ombc(Arc::new(RecordingDevice {
                name: "ombc",
                recorder: recorder.clone(),
            }))))
    }

    #[test]
    fn test_details_from_config() {
        let config = ResourceManagerConfig {
            resource_id: "boiler-7".to_string(),
            name: Some("Boiler".to_string()),
            roles: vec![Role {
                role: RoleType::EnergyConsumer,
                commodity: Commodity::Electricity,
            }],
            instruction_processing_delay_ms: 150,
            ..ResourceManagerConfig::default()
        };
        let rm = ResourceManagerHandler::new(config).with_control_type(Arc::new(NoControl));

        let details = rm.details();
        assert_eq!(details.resource_id, "boiler-7");
        assert_eq!(details.name.as_deref(), Some("Boiler"));
        assert_eq!(details.instruction_processing_delay, 150);
        assert_eq!(
            details.available_control_types,
            vec![ControlTypeTag::NotControlable]
        );
    }

    #[test]
    fn test_same_tag_replaces_control_type() {
        let recorder = Arc::new(Recorder::default());
        let rm = handler(&recorder).with_control_type(Arc::new(NoControl));

        assert_eq!(
            rm.available_control_types(),
            vec![
                ControlTypeTag::FillRateBasedControl,
                ControlTypeTag::OperationModeBasedControl,
                ControlTypeTag::NotControlable,
            ]
        );
    }

    #[tokio::test]
    async fn test_deactivation_precedes_activation() {
        let recorder = Arc::new(Recorder::default());
        let rm = handler(&recorder);
        let conn = idle_connection();

        rm.select_control_type(&conn, ControlTypeTag::FillRateBasedControl)
            .await
            .unwrap();
        assert_eq!(rm.active_control_type(), Some(ControlTypeTag::FillRateBasedControl));
        assert!(conn.has_handler("FRBC.Instruction"));

        rm.select_control_type(&conn, ControlTypeTag::OperationModeBasedControl)
            .await
            .unwrap();
        assert!(!conn.has_handler("FRBC.Instruction"));
        assert!(conn.has_handler("OMBC.Instruction"));

        assert_eq!(
            recorder.events(),
            vec!["activate frbc", "deactivate frbc", "activate ombc"]
        );
    }

    #[tokio::test]
    async fn test_unknown_selection_leaves_nothing_active() {
        let recorder = Arc::new(Recorder::default());
        let rm = handler(&recorder);
        let conn = idle_connection();

        rm.select_control_type(&conn, ControlTypeTag::FillRateBasedControl)
            .await
            .unwrap();
        rm.select_control_type(&conn, ControlTypeTag::PowerEnvelopeBasedControl)
            .await
            .unwrap();

        assert_eq!(rm.active_control_type(), None);
        assert!(!conn.has_handler("FRBC.Instruction"));
        assert_eq!(recorder.events(), vec!["activate frbc", "deactivate frbc"]);
    }

    #[tokio::test]
    async fn test_session_end_deactivates() {
        let recorder = Arc::new(Recorder::default());
        let rm = handler(&recorder);
        let conn = idle_connection();

        rm.select_control_type(&conn, ControlTypeTag::OperationModeBasedControl)
            .await
            .unwrap();
        rm.on_session_end(conn.clone()).await.unwrap();

        assert_eq!(rm.active_control_type(), None);
        assert!(!conn.has_handler("OMBC.Instruction"));
        assert_eq!(recorder.events(), vec!["activate ombc", "deactivate ombc"]);
    }

    #[test]
    fn test_attach_registers_core_handlers() {
        let recorder = Arc::new(Recorder::default());
        let rm = Arc::new(handler(&recorder));
        let conn = idle_connection();

        rm.attach(&conn);
        for message_type in [
            "Handshake",
            "HandshakeResponse",
            "SelectControlType",
            "SessionRequest",
        ] {
            assert!(conn.has_handler(message_type), "{message_type}");
        }
    }
}
