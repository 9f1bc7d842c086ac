//! End-to-end Resource Manager lifecycle tests.
//!
//! The peer plays a CEM: it answers the RM handshake, reads the
//! `ResourceManagerDetails`, selects control types and sends instructions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use s2::config::{ConnectionConfig, ResourceManagerConfig};
use s2::connection::{AckCapsule, Connection, ConnectionState};
use s2::control::{ControlDevice, InstructionControl, NoControl, ResourceManagerHandler};
use s2::medium::{ChannelMedium, ChannelPeer, PeerSession};
use s2::protocol::{ControlTypeTag, JsonParser, Message, PROTOCOL_VERSION};
use serde_json::{json, Value};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Boiler that logs what the CEM asks of it.
#[derive(Default)]
struct Boiler {
    log: Mutex<Vec<String>>,
}

impl Boiler {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

struct BoilerDevice(Arc<Boiler>);

impl ControlDevice for BoilerDevice {
    fn handle_instruction(
        &self,
        _conn: Connection,
        instruction: Message,
        ack: AckCapsule,
    ) -> BoxFuture<'_, s2::Result<()>> {
        Box::pin(async move {
            self.0
                .record(format!("instruction {}", instruction.message_type()));
            ack.ok().await
        })
    }

    fn on_activate(&self, _conn: Connection) -> BoxFuture<'_, s2::Result<()>> {
        self.0.record("activate");
        Box::pin(async { Ok(()) })
    }

    fn on_deactivate(&self, _conn: Connection) -> BoxFuture<'_, s2::Result<()>> {
        self.0.record("deactivate");
        Box::pin(async { Ok(()) })
    }
}

struct Rig {
    conn: Connection,
    rm: Arc<ResourceManagerHandler>,
    boiler: Arc<Boiler>,
    peer: ChannelPeer,
}

fn rig(config: ConnectionConfig) -> Rig {
    init_tracing();
    let (medium, peer) = ChannelMedium::new();
    let conn = Connection::new(config, medium, Arc::new(JsonParser::new()));

    let boiler = Arc::new(Boiler::default());
    let rm = Arc::new(
        ResourceManagerHandler::new(ResourceManagerConfig {
            resource_id: "boiler-1".to_string(),
            name: Some("Boiler".to_string()),
            ..ResourceManagerConfig::default()
        })
        .with_control_type(Arc::new(NoControl))
        .with_control_type(Arc::new(InstructionControl::frbc(Arc::new(BoilerDevice(
            boiler.clone(),
        ))))),
    );
    rm.clone().attach(&conn);

    Rig {
        conn,
        rm,
        boiler,
        peer,
    }
}

fn no_reconnect() -> ConnectionConfig {
    ConnectionConfig::default().with_reconnect(false)
}

async fn next_frame(session: &mut PeerSession) -> Value {
    session
        .recv_json_within(WAIT)
        .await
        .expect("frame from engine")
}

fn ack(session: &PeerSession, frame: &Value) {
    session
        .send_json(&json!({
            "message_type": "ReceptionStatus",
            "subject_message_id": frame["message_id"],
            "status": "OK",
        }))
        .unwrap();
}

/// Send `message` from the CEM and expect an OK for it.
async fn cem_send(session: &mut PeerSession, message: Value) {
    let id = message["message_id"].clone();
    session.send_json(&message).unwrap();

    let status = next_frame(session).await;
    assert_eq!(status["message_type"], "ReceptionStatus");
    assert_eq!(status["subject_message_id"], id);
    assert_eq!(status["status"], "OK");
}

/// The ack for `SelectControlType` goes out before the switch completes.
async fn wait_active(rm: &ResourceManagerHandler, tag: Option<ControlTypeTag>) {
    tokio::time::timeout(WAIT, async {
        while rm.active_control_type() != tag {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("control type switched");
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn select(control_type: &str) -> Value {
    json!({
        "message_type": "SelectControlType",
        "message_id": new_id(),
        "control_type": control_type,
    })
}

/// Run the handshake and details exchange; returns the RM details frame.
async fn negotiate(session: &mut PeerSession) -> Value {
    let handshake = next_frame(session).await;
    assert_eq!(handshake["message_type"], "Handshake");
    assert_eq!(handshake["role"], "RM");
    assert_eq!(handshake["supported_protocol_versions"], json!([PROTOCOL_VERSION]));
    ack(session, &handshake);

    cem_send(
        session,
        json!({
            "message_type": "Handshake",
            "message_id": new_id(),
            "role": "CEM",
            "supported_protocol_versions": [PROTOCOL_VERSION],
        }),
    )
    .await;

    cem_send(
        session,
        json!({
            "message_type": "HandshakeResponse",
            "message_id": new_id(),
            "selected_protocol_version": PROTOCOL_VERSION,
        }),
    )
    .await;

    let details = next_frame(session).await;
    assert_eq!(details["message_type"], "ResourceManagerDetails");
    ack(session, &details);
    details
}

/// Test complete negotiation from handshake to details
#[tokio::test]
async fn test_full_negotiation() {
    let mut rig = rig(no_reconnect());
    rig.conn.start().unwrap();
    let mut session = rig.peer.accept_within(WAIT).await.unwrap();

    let details = negotiate(&mut session).await;
    assert_eq!(details["resource_id"], "boiler-1");
    assert_eq!(details["name"], "Boiler");
    assert_eq!(
        details["available_control_types"],
        json!(["NOT_CONTROLABLE", "FILL_RATE_BASED_CONTROL"])
    );
    assert_eq!(rig.rm.active_control_type(), None);
    rig.conn.stop().await;
}

/// Test switching from NoControl to FRBC routes instructions to the device
#[tokio::test]
async fn test_switch_to_frbc_routes_instructions() {
    let mut rig = rig(no_reconnect());
    rig.conn.start().unwrap();
    let mut session = rig.peer.accept_within(WAIT).await.unwrap();
    negotiate(&mut session).await;

    cem_send(&mut session, select("NOT_CONTROLABLE")).await;
    wait_active(&rig.rm, Some(ControlTypeTag::NotControlable)).await;
    assert!(!rig.conn.has_handler("FRBC.Instruction"));

    cem_send(&mut session, select("FILL_RATE_BASED_CONTROL")).await;
    wait_active(&rig.rm, Some(ControlTypeTag::FillRateBasedControl)).await;

    cem_send(
        &mut session,
        json!({
            "message_type": "FRBC.Instruction",
            "message_id": new_id(),
            "operation_mode": new_id(),
            "operation_mode_factor": 0.5,
        }),
    )
    .await;

    assert_eq!(
        rig.boiler.log(),
        vec!["activate", "instruction FRBC.Instruction"]
    );
    rig.conn.stop().await;
    assert_eq!(
        rig.boiler.log(),
        vec!["activate", "instruction FRBC.Instruction", "deactivate"]
    );
}

/// Test instructions for an unselected control type are not handled
#[tokio::test]
async fn test_instruction_without_selection_is_dropped() {
    let mut rig = rig(no_reconnect());
    rig.conn.start().unwrap();
    let mut session = rig.peer.accept_within(WAIT).await.unwrap();
    negotiate(&mut session).await;

    session
        .send_json(&json!({
            "message_type": "FRBC.Instruction",
            "message_id": new_id(),
        }))
        .unwrap();
    assert!(session
        .recv_json_within(Duration::from_millis(100))
        .await
        .is_none());
    assert!(rig.boiler.log().is_empty());
    rig.conn.stop().await;
}

/// Test peer hang-up deactivates the control type
#[tokio::test]
async fn test_disconnect_deactivates_control_type() {
    let mut rig = rig(no_reconnect());
    rig.conn.start().unwrap();
    let mut session = rig.peer.accept_within(WAIT).await.unwrap();
    negotiate(&mut session).await;
    cem_send(&mut session, select("FILL_RATE_BASED_CONTROL")).await;
    wait_active(&rig.rm, Some(ControlTypeTag::FillRateBasedControl)).await;

    session.disconnect();
    tokio::time::timeout(WAIT, rig.conn.wait_stopped())
        .await
        .unwrap();

    assert_eq!(rig.rm.active_control_type(), None);
    assert_eq!(rig.boiler.log(), vec!["activate", "deactivate"]);
}

/// Test SessionRequest RECONNECT renegotiates on a new session
#[tokio::test]
async fn test_session_request_reconnect() {
    let mut rig = rig(
        ConnectionConfig::default()
            .with_reconnect(true)
            .with_reconnect_delay(Duration::from_millis(10)),
    );
    rig.conn.start().unwrap();
    let mut first = rig.peer.accept_within(WAIT).await.unwrap();
    negotiate(&mut first).await;
    cem_send(&mut first, select("FILL_RATE_BASED_CONTROL")).await;
    wait_active(&rig.rm, Some(ControlTypeTag::FillRateBasedControl)).await;

    cem_send(
        &mut first,
        json!({
            "message_type": "SessionRequest",
            "message_id": new_id(),
            "request": "RECONNECT",
        }),
    )
    .await;

    let mut second = rig.peer.accept_within(WAIT).await.expect("new session");
    negotiate(&mut second).await;

    assert_eq!(rig.conn.session_count(), 2);
    assert_eq!(rig.rm.active_control_type(), None);
    assert_eq!(rig.boiler.log(), vec!["activate", "deactivate"]);
    rig.conn.stop().await;
}

/// Test SessionRequest TERMINATE stops the connection
#[tokio::test]
async fn test_session_request_terminate() {
    let mut rig = rig(ConnectionConfig::default().with_reconnect(true));
    rig.conn.start().unwrap();
    let mut session = rig.peer.accept_within(WAIT).await.unwrap();
    negotiate(&mut session).await;

    cem_send(
        &mut session,
        json!({
            "message_type": "SessionRequest",
            "message_id": new_id(),
            "request": "TERMINATE",
            "diagnostic_label": "CEM shutting down",
        }),
    )
    .await;

    tokio::time::timeout(WAIT, rig.conn.wait_stopped())
        .await
        .unwrap();
    assert_eq!(rig.conn.state(), ConnectionState::Stopped);
    assert_eq!(rig.conn.session_count(), 1);
}

/// Test unanswered handshake restarts negotiation from scratch
#[tokio::test(start_paused = true)]
async fn test_unacknowledged_handshake_restarts() {
    let mut rig = rig(
        ConnectionConfig::default()
            .with_reconnect(true)
            .with_ack_timeout(Duration::from_secs(1))
            .with_reconnect_delay(Duration::from_millis(10)),
    );
    rig.conn.start().unwrap();

    let mut first = rig.peer.accept_within(WAIT).await.unwrap();
    let handshake = next_frame(&mut first).await;
    assert_eq!(handshake["message_type"], "Handshake");

    let mut second = rig.peer.accept_within(WAIT).await.expect("restarted session");
    let retry = next_frame(&mut second).await;
    assert_eq!(retry["message_type"], "Handshake");
    assert_ne!(retry["message_id"], handshake["message_id"]);
    rig.conn.stop().await;
}
