//! Scenarios from spec §8, driven through a real `SessionManager` over an
//! in-memory duplex and the `tunnox-cloud-control` reference plane — the
//! same components `services/tunnox-node` wires together, rather than the
//! stub collaborators the unit tests in `src/` use.

use std::sync::Arc;
use std::time::Duration;

use tunnox_cloud_control::{AllowAllIpPolicy, FixedWindowAnonymousRateLimiter, FixedWindowBruteForceGuard, InMemoryBroker, InMemoryCloudControl, InMemoryKv, StaticNodeDirectory};
use tunnox_core::auth::Authenticator;
use tunnox_core::bridge::{BridgeAdapter, BridgeService};
use tunnox_core::broker::TunnelBroker;
use tunnox_core::codec;
use tunnox_core::codes::ConnectionCodeStore;
use tunnox_core::config::{AuthConfig, ResourceLimits, Timeouts};
use tunnox_core::contracts::{Broker, CloudControl};
use tunnox_core::dispatch::CommandDispatcher;
use tunnox_core::handlers::register_handlers;
use tunnox_core::registry::ControlRegistry;
use tunnox_core::resume::ResumeManager;
use tunnox_core::session::SessionManager;
use tunnox_core::state::TunnelStateStore;
use tunnox_core::tunnels::TunnelRegistry;
use tunnox_types::{CommandPacket, CommandType, GenericResponse, HandshakeRequest, HandshakeResponse, TransferPacket};

fn harness(cloud_control: Arc<InMemoryCloudControl>, brute_force: Arc<FixedWindowBruteForceGuard>) -> SessionManager {
    let control_registry = Arc::new(ControlRegistry::new(100));
    let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_secs(1)));
    let cloud_control: Arc<dyn CloudControl> = cloud_control;

    let authenticator = Arc::new(Authenticator::new(
        cloud_control.clone(),
        Arc::new(AllowAllIpPolicy),
        brute_force,
        Arc::new(FixedWindowAnonymousRateLimiter::new(100, Duration::from_secs(60))),
        AuthConfig::default(),
    ));

    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv.clone(), Some(b"test-state-secret".to_vec()), Duration::from_secs(300)));
    let resume_manager = Arc::new(ResumeManager::new(state_store, Some(b"test-resume-secret".to_vec()), Timeouts::default()));
    let codes = Arc::new(ConnectionCodeStore::new(kv));
    let tunnel_registry = Arc::new(TunnelRegistry::new(100));

    let in_memory_broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new("node-a"));
    let broker = Arc::new(TunnelBroker::new(
        cloud_control.clone(),
        control_registry.clone(),
        tunnel_registry.clone(),
        dispatcher.clone(),
        Arc::new(BridgeAdapter::new(in_memory_broker, "node-a")),
        Arc::new(BridgeService::new()),
        Arc::new(StaticNodeDirectory::new(Default::default())),
        resume_manager.clone(),
        Timeouts::default(),
    ));

    register_handlers(&dispatcher, control_registry.clone(), tunnel_registry, broker.clone(), cloud_control, codes);

    SessionManager::new(control_registry, dispatcher, authenticator, broker, resume_manager, ResourceLimits::default(), Timeouts::default())
}

async fn open_client(manager: &SessionManager, remote_addr: &str) -> (tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>) {
    let (client_side, server_side) = tokio::io::duplex(8192);
    let (server_reader, server_writer) = tokio::io::split(server_side);
    let accept = tokio::spawn({
        let manager = manager.clone();
        let remote_addr = remote_addr.to_string();
        async move {
            manager.serve_connection(remote_addr, "tcp".into(), server_reader, server_writer).await;
        }
    });
    let (client_reader, client_writer) = tokio::io::split(client_side);
    (client_reader, client_writer, accept)
}

async fn send_handshake(writer: &mut (impl tokio::io::AsyncWrite + Unpin), req_id: &str, req: &HandshakeRequest) {
    let body = serde_json::to_string(req).unwrap();
    let packet = TransferPacket::command(CommandPacket::request(CommandType::Handshake as u16, req_id, body));
    codec::write_packet(writer, &packet).await.unwrap();
}

async fn read_handshake_response(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> HandshakeResponse {
    let response = codec::read_packet(reader).await.unwrap();
    let cmd = response.as_command().unwrap();
    serde_json::from_str(&cmd.body).unwrap()
}

/// Spec §8 scenario 2: a registered client completes the full two-phase
/// HMAC challenge-response handshake and is granted access to an
/// authenticated-only command afterwards.
#[tokio::test]
async fn challenge_response_handshake_authenticates_a_registered_client() {
    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv, Some(b"cc-state-secret".to_vec()), Duration::from_secs(300)));
    let cloud_control = Arc::new(InMemoryCloudControl::new(state_store, b"cc-resume-secret".to_vec()));
    let secret = b"correct-horse-battery-staple";
    cloud_control.register_client(42_000_001, secret, false, None);

    let manager = harness(cloud_control, Arc::new(FixedWindowBruteForceGuard::new(5, Duration::from_secs(900))));
    let (mut reader, mut writer, accept) = open_client(&manager, "198.51.100.10:1234").await;

    send_handshake(
        &mut writer,
        "req-1",
        &HandshakeRequest {
            client_id: 42_000_001,
            token: String::new(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let phase_one = read_handshake_response(&mut reader).await;
    assert!(!phase_one.success);
    assert_eq!(phase_one.need_response, Some(true));
    let challenge_bytes = tunnox_common::encoding::decode(&phase_one.challenge.expect("phase one carries a challenge")).unwrap();
    let tag = tunnox_common::crypto::hmac_sha256(secret, &challenge_bytes);

    send_handshake(
        &mut writer,
        "req-2",
        &HandshakeRequest {
            client_id: 42_000_001,
            token: String::new(),
            challenge_response: Some(tunnox_common::encoding::encode(&tag)),
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let phase_two = read_handshake_response(&mut reader).await;
    assert!(phase_two.success);

    let list_req = TransferPacket::command(CommandPacket::request(CommandType::MappingList as u16, "req-3", "{}"));
    codec::write_packet(&mut writer, &list_req).await.unwrap();
    let list_resp = codec::read_packet(&mut reader).await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&list_resp.as_command().unwrap().body).unwrap();
    assert!(body.get("mappings").is_some(), "authenticated connection should reach the mapping handler, got {body:?}");

    drop(writer);
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;
}

/// Spec §8 scenario 3: the sixth consecutive failed attempt from one IP
/// inside the brute-force window is rejected before a challenge is even
/// evaluated, regardless of whether the response would have verified.
#[tokio::test]
async fn brute_force_guard_locks_out_after_repeated_failures() {
    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv, Some(b"cc-state-secret".to_vec()), Duration::from_secs(300)));
    let cloud_control = Arc::new(InMemoryCloudControl::new(state_store, b"cc-resume-secret".to_vec()));
    cloud_control.register_client(42_000_002, b"the-real-secret", false, None);

    let manager = harness(cloud_control, Arc::new(FixedWindowBruteForceGuard::new(5, Duration::from_secs(900))));
    let remote_addr = "198.51.100.20:4321";

    for attempt in 0..5 {
        let (mut reader, mut writer, accept) = open_client(&manager, remote_addr).await;
        send_handshake(
            &mut writer,
            "req",
            &HandshakeRequest {
                client_id: 42_000_002,
                token: String::new(),
                challenge_response: Some("bm90LXRoZS1yaWdodC10YWc=".into()),
                protocol: "tcp".into(),
                version: "1.0".into(),
            },
        )
        .await;
        let resp = read_handshake_response(&mut reader).await;
        assert!(!resp.success, "attempt {attempt} unexpectedly succeeded");
        drop(writer);
        drop(reader);
        let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;
    }

    let (mut reader, mut writer, accept) = open_client(&manager, remote_addr).await;
    send_handshake(
        &mut writer,
        "req-locked",
        &HandshakeRequest {
            client_id: 42_000_002,
            token: String::new(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let resp = read_handshake_response(&mut reader).await;
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Access denied: too many failed attempts"));

    drop(writer);
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;
}

/// Spec §8 scenario 1: an anonymous client bootstraps a fresh identity and
/// can reuse the issued secret for a subsequent full-duplex session.
#[tokio::test]
async fn anonymous_bootstrap_then_reconnect_with_issued_credentials() {
    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv, Some(b"cc-state-secret".to_vec()), Duration::from_secs(300)));
    let cloud_control = Arc::new(InMemoryCloudControl::new(state_store, b"cc-resume-secret".to_vec()));

    let manager = harness(cloud_control, Arc::new(FixedWindowBruteForceGuard::new(5, Duration::from_secs(900))));

    let (mut reader, mut writer, accept) = open_client(&manager, "203.0.113.5:1111").await;
    send_handshake(
        &mut writer,
        "req-1",
        &HandshakeRequest {
            client_id: 0,
            token: "new-client".into(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let bootstrap = read_handshake_response(&mut reader).await;
    assert!(bootstrap.success);
    let issued_client_id = bootstrap.client_id.expect("bootstrap issues a client id");
    let issued_secret = tunnox_common::encoding::decode(&bootstrap.secret_key.expect("bootstrap issues a secret")).unwrap();
    drop(writer);
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;

    let (mut reader, mut writer, accept) = open_client(&manager, "203.0.113.5:2222").await;
    send_handshake(
        &mut writer,
        "req-1",
        &HandshakeRequest {
            client_id: issued_client_id,
            token: String::new(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let phase_one = read_handshake_response(&mut reader).await;
    let challenge_bytes = tunnox_common::encoding::decode(&phase_one.challenge.unwrap()).unwrap();
    let tag = tunnox_common::crypto::hmac_sha256(&issued_secret, &challenge_bytes);

    send_handshake(
        &mut writer,
        "req-2",
        &HandshakeRequest {
            client_id: issued_client_id,
            token: String::new(),
            challenge_response: Some(tunnox_common::encoding::encode(&tag)),
            protocol: "tcp".into(),
            version: "1.0".into(),
        },
    )
    .await;
    let phase_two = read_handshake_response(&mut reader).await;
    assert!(phase_two.success);

    drop(writer);
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;
}

/// A command sent for a control connection that was never authenticated
/// gets a `GenericResponse` error rather than the packet being silently
/// dropped or the connection being torn down.
#[tokio::test]
async fn unauthenticated_command_gets_a_generic_error_response() {
    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv, Some(b"cc-state-secret".to_vec()), Duration::from_secs(300)));
    let cloud_control = Arc::new(InMemoryCloudControl::new(state_store, b"cc-resume-secret".to_vec()));
    let manager = harness(cloud_control, Arc::new(FixedWindowBruteForceGuard::new(5, Duration::from_secs(900))));

    let (mut reader, mut writer, accept) = open_client(&manager, "192.0.2.1:1").await;
    let packet = TransferPacket::command(CommandPacket::request(CommandType::ConfigGet as u16, "req-1", "{}"));
    codec::write_packet(&mut writer, &packet).await.unwrap();
    let response = codec::read_packet(&mut reader).await.unwrap();
    let body: GenericResponse = serde_json::from_str(&response.as_command().unwrap().body).unwrap();
    assert!(!body.success);

    drop(writer);
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(1), accept).await;
}
