//! Key command handlers (spec §4.6): connection codes, mapping management,
//! `CONFIG_GET`, and the two-phase tunnel-open exchange. Each handler is a
//! small `CommandHandler` that looks its calling connection up in the
//! control registry (C4) by `connID` — the dispatcher (C6) hands handlers
//! only `connID` and the raw body, never the connection object itself — and
//! otherwise defers to its injected collaborator (the broker, the
//! connection-code store, or the cloud-control plane).

use std::sync::Arc;

use async_trait::async_trait;
use tunnox_types::{
    ConfigGetResponse, ConnectionCodeActivateRequest, ConnectionCodeActivateResponse, ConnectionCodeGenerateRequest,
    ConnectionCodeGenerateResponse, ConnectionCodeListResponse, ConnectionCodeSummary, CoreError, MappingIdRequest, MappingListResponse,
    MappingRole, MappingSummary, TunnelOpenReady, TunnelOpenRequest, TunnelOpenResponse,
};

use crate::broker::TunnelBroker;
use crate::codes::ConnectionCodeStore;
use crate::contracts::CloudControl;
use crate::dispatch::{CommandDispatcher, CommandHandler, Direction, HandlerInfo, HandlerOutcome};
use crate::registry::ControlRegistry;
use crate::tunnels::TunnelRegistry;

fn mapping_status_str(status: tunnox_types::MappingStatus) -> String {
    match status {
        tunnox_types::MappingStatus::Active => "active".to_string(),
        tunnox_types::MappingStatus::Disabled => "disabled".to_string(),
        tunnox_types::MappingStatus::Expired => "expired".to_string(),
    }
}

fn mapping_summary(mapping: &tunnox_types::PortMapping, client_id: i64) -> MappingSummary {
    let role = if mapping.listen_client_id == client_id {
        MappingRole::Listener
    } else {
        MappingRole::Target
    };
    MappingSummary {
        id: mapping.id.clone(),
        role,
        protocol: mapping.protocol.clone(),
        target_host: mapping.target_host.clone(),
        target_port: mapping.target_port,
        status: mapping_status_str(mapping.status),
    }
}

fn authenticated_client_id(registry: &ControlRegistry, conn_id: &str) -> Result<i64, CoreError> {
    registry
        .get_by_conn_id(conn_id)
        .ok_or_else(|| CoreError::unauthorized("connection is not registered"))?
        .client_id()
        .ok_or_else(|| CoreError::unauthorized("connection is not authenticated"))
}

fn reply<T: serde::Serialize>(value: &T) -> Result<HandlerOutcome, CoreError> {
    let body = serde_json::to_string(value).map_err(|e| CoreError::internal(e.to_string()))?;
    Ok(HandlerOutcome::Reply(body))
}

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CoreError> {
    serde_json::from_str(body).map_err(|e| CoreError::invalid_param(e.to_string()))
}

pub struct ConnectionCodeGenerateHandler {
    pub registry: Arc<ControlRegistry>,
    pub codes: Arc<ConnectionCodeStore>,
}

#[async_trait]
impl CommandHandler for ConnectionCodeGenerateHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::ConnectionCodeGenerate as u16,
            category: "connection_code",
            direction: Direction::ClientToServer,
            name: "connection_code_generate",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let req: ConnectionCodeGenerateRequest = parse(body)?;

        let code = self.codes.generate(client_id, req.protocol, req.target_host, req.target_port).await?;

        reply(&ConnectionCodeGenerateResponse {
            code: code.code,
            expires_at: Some(code.expires_at),
        })
    }
}

pub struct ConnectionCodeListHandler {
    pub registry: Arc<ControlRegistry>,
    pub codes: Arc<ConnectionCodeStore>,
}

#[async_trait]
impl CommandHandler for ConnectionCodeListHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::ConnectionCodeList as u16,
            category: "connection_code",
            direction: Direction::ClientToServer,
            name: "connection_code_list",
        }
    }

    async fn handle(&self, conn_id: &str, _body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let codes = self.codes.list(client_id).await?;

        reply(&ConnectionCodeListResponse {
            codes: codes
                .into_iter()
                .map(|c| ConnectionCodeSummary {
                    code: c.code,
                    expires_at: Some(c.expires_at),
                })
                .collect(),
        })
    }
}

pub struct ConnectionCodeActivateHandler {
    pub registry: Arc<ControlRegistry>,
    pub codes: Arc<ConnectionCodeStore>,
    pub cloud_control: Arc<dyn CloudControl>,
}

#[async_trait]
impl CommandHandler for ConnectionCodeActivateHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::ConnectionCodeActivate as u16,
            category: "connection_code",
            direction: Direction::ClientToServer,
            name: "connection_code_activate",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let req: ConnectionCodeActivateRequest = parse(body)?;

        let code = self.codes.activate(&req.code).await?;
        if code.owner_client_id == client_id {
            return Err(CoreError::invalid_param("cannot activate your own connection code"));
        }

        let mapping = self
            .cloud_control
            .create_port_mapping(code.owner_client_id, client_id, &code.protocol, &code.target_host, code.target_port)
            .await?;

        reply(&ConnectionCodeActivateResponse {
            mapping_id: mapping.id,
            secret_key: mapping.secret_key,
        })
    }
}

pub struct MappingListHandler {
    pub registry: Arc<ControlRegistry>,
    pub cloud_control: Arc<dyn CloudControl>,
}

#[async_trait]
impl CommandHandler for MappingListHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::MappingList as u16,
            category: "mapping",
            direction: Direction::ClientToServer,
            name: "mapping_list",
        }
    }

    async fn handle(&self, conn_id: &str, _body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let mappings = self.cloud_control.get_client_port_mappings(client_id).await?;

        reply(&MappingListResponse {
            mappings: mappings.iter().map(|m| mapping_summary(m, client_id)).collect(),
        })
    }
}

pub struct MappingGetHandler {
    pub registry: Arc<ControlRegistry>,
    pub cloud_control: Arc<dyn CloudControl>,
}

#[async_trait]
impl CommandHandler for MappingGetHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::MappingGet as u16,
            category: "mapping",
            direction: Direction::ClientToServer,
            name: "mapping_get",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let req: MappingIdRequest = parse(body)?;

        let mapping = self
            .cloud_control
            .get_port_mapping(&req.mapping_id)
            .await?
            .ok_or_else(|| CoreError::mapping_not_found(format!("no such mapping {}", req.mapping_id)))?;

        if !mapping.authorizes(client_id) {
            return Err(CoreError::mapping_unauthorized("client is neither the listener nor the target of this mapping"));
        }

        reply(&mapping_summary(&mapping, client_id))
    }
}

pub struct MappingDeleteHandler {
    pub registry: Arc<ControlRegistry>,
    pub cloud_control: Arc<dyn CloudControl>,
}

#[async_trait]
impl CommandHandler for MappingDeleteHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::MappingDelete as u16,
            category: "mapping",
            direction: Direction::ClientToServer,
            name: "mapping_delete",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let req: MappingIdRequest = parse(body)?;

        let mapping = self
            .cloud_control
            .get_port_mapping(&req.mapping_id)
            .await?
            .ok_or_else(|| CoreError::mapping_not_found(format!("no such mapping {}", req.mapping_id)))?;
        if !mapping.authorizes(client_id) {
            return Err(CoreError::mapping_unauthorized("client is neither the listener nor the target of this mapping"));
        }

        self.cloud_control.delete_port_mapping(client_id, &req.mapping_id).await?;
        reply(&tunnox_types::GenericResponse::ok())
    }
}

pub struct ConfigGetHandler {
    pub registry: Arc<ControlRegistry>,
    pub cloud_control: Arc<dyn CloudControl>,
}

#[async_trait]
impl CommandHandler for ConfigGetHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::ConfigGet as u16,
            category: "config",
            direction: Direction::ClientToServer,
            name: "config_get",
        }
    }

    async fn handle(&self, conn_id: &str, _body: &str) -> Result<HandlerOutcome, CoreError> {
        let client_id = authenticated_client_id(&self.registry, conn_id)?;
        let mappings = self.cloud_control.get_client_port_mappings(client_id).await?;

        reply(&ConfigGetResponse {
            mappings: mappings.iter().map(|m| mapping_summary(m, client_id)).collect(),
        })
    }
}

/// Shared by both `TUNNEL_OPEN_REQUEST` and the SOCKS5 dynamic-target
/// variant (spec §4.6: "SOCKS5 dynamic targets are a variant of the
/// MappingID path ... these override the mapping's static target"). Both
/// command types carry the identical `TunnelOpenRequest` body shape, so one
/// function authorizes and replies for either.
async fn handle_tunnel_open_request(registry: &ControlRegistry, broker: &TunnelBroker, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
    let conn = registry
        .get_by_conn_id(conn_id)
        .ok_or_else(|| CoreError::unauthorized("connection is not registered"))?;
    let req: TunnelOpenRequest = parse(body)?;
    let tunnel_id = req.tunnel_id.clone();

    let resume_token = broker.handle_tunnel_open(&conn, req).await?;

    reply(&TunnelOpenResponse { tunnel_id, resume_token })
}

pub struct TunnelOpenRequestHandler {
    pub registry: Arc<ControlRegistry>,
    pub broker: Arc<TunnelBroker>,
}

#[async_trait]
impl CommandHandler for TunnelOpenRequestHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::TunnelOpenRequest as u16,
            category: "tunnel",
            direction: Direction::Duplex,
            name: "tunnel_open_request",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        handle_tunnel_open_request(&self.registry, &self.broker, conn_id, body).await
    }
}

pub struct Socks5DynamicTunnelRequestHandler {
    pub registry: Arc<ControlRegistry>,
    pub broker: Arc<TunnelBroker>,
}

#[async_trait]
impl CommandHandler for Socks5DynamicTunnelRequestHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::Socks5DynamicTunnelRequest as u16,
            category: "tunnel",
            direction: Direction::ClientToServer,
            name: "socks5_dynamic_tunnel_request",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        handle_tunnel_open_request(&self.registry, &self.broker, conn_id, body).await
    }
}

/// Second phase of the tunnel-open exchange (spec §4.7/§4.9 Design Notes).
/// `TUNNEL_OPEN_REQUEST` only authorizes and acknowledges — the connection
/// stays in framed mode so the ack can still be sent. This handler fires on
/// the client's follow-up `TUNNEL_OPEN_READY` and is the only thing that
/// actually returns `HandlerOutcome::EnterStreaming`, which is what makes
/// the packet loop detach its reader/writer and hand them to the broker.
pub struct TunnelOpenReadyHandler {
    pub registry: Arc<ControlRegistry>,
    pub tunnel_registry: Arc<TunnelRegistry>,
}

#[async_trait]
impl CommandHandler for TunnelOpenReadyHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            command_type: tunnox_types::CommandType::TunnelOpenReady as u16,
            category: "tunnel",
            direction: Direction::ClientToServer,
            name: "tunnel_open_ready",
        }
    }

    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError> {
        authenticated_client_id(&self.registry, conn_id)?;
        let req: TunnelOpenReady = parse(body)?;

        let owns_a_side = self.tunnel_registry.sides(&req.tunnel_id).iter().any(|side| side.conn_id == conn_id);
        if !owns_a_side {
            return Err(CoreError::unauthorized("connection does not own a side of this tunnel"));
        }

        Ok(HandlerOutcome::EnterStreaming(req.tunnel_id))
    }
}

/// Registers every handler this module provides with `dispatcher` (spec
/// §4.6's "Key handlers the core must provide" list). Called once by the
/// binary wiring the core to a transport, after all the collaborators below
/// have been constructed.
#[allow(clippy::too_many_arguments)]
pub fn register_handlers(
    dispatcher: &Arc<CommandDispatcher>,
    registry: Arc<ControlRegistry>,
    tunnel_registry: Arc<TunnelRegistry>,
    broker: Arc<TunnelBroker>,
    cloud_control: Arc<dyn CloudControl>,
    codes: Arc<ConnectionCodeStore>,
) {
    dispatcher.register(Arc::new(ConnectionCodeGenerateHandler {
        registry: registry.clone(),
        codes: codes.clone(),
    }));
    dispatcher.register(Arc::new(ConnectionCodeListHandler {
        registry: registry.clone(),
        codes: codes.clone(),
    }));
    dispatcher.register(Arc::new(ConnectionCodeActivateHandler {
        registry: registry.clone(),
        codes,
        cloud_control: cloud_control.clone(),
    }));
    dispatcher.register(Arc::new(MappingListHandler {
        registry: registry.clone(),
        cloud_control: cloud_control.clone(),
    }));
    dispatcher.register(Arc::new(MappingGetHandler {
        registry: registry.clone(),
        cloud_control: cloud_control.clone(),
    }));
    dispatcher.register(Arc::new(MappingDeleteHandler {
        registry: registry.clone(),
        cloud_control: cloud_control.clone(),
    }));
    dispatcher.register(Arc::new(ConfigGetHandler {
        registry: registry.clone(),
        cloud_control,
    }));
    dispatcher.register(Arc::new(TunnelOpenRequestHandler {
        registry: registry.clone(),
        broker: broker.clone(),
    }));
    dispatcher.register(Arc::new(Socks5DynamicTunnelRequestHandler {
        registry: registry.clone(),
        broker,
    }));
    dispatcher.register(Arc::new(TunnelOpenReadyHandler { registry, tunnel_registry }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeAdapter, BridgeService};
    use crate::config::Timeouts;
    use crate::connection::{ConnectionSink, ControlConnection};
    use crate::contracts::{AnonymousBootstrap, Broker, ClientConfig, ClientSummary, InboundMessage, NodeDirectory};
    use crate::resume::ResumeManager;
    use crate::state::TunnelStateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tunnox_types::{MappingStatus, PortMapping, TransferPacket, TunnelState};

    #[derive(Default)]
    struct MemKv(Mutex<HashMap<String, Vec<u8>>>);
    #[async_trait]
    impl crate::contracts::Kv for MemKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
            Ok(self.0.lock().get(key).cloned())
        }
        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), CoreError> {
            self.0.lock().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), CoreError> {
            self.0.lock().remove(key);
            Ok(())
        }
        async fn exists(&self, key: &str) -> Result<bool, CoreError> {
            Ok(self.0.lock().contains_key(key))
        }
    }

    struct NoopSink;
    #[async_trait]
    impl ConnectionSink for NoopSink {
        async fn send(&self, _packet: TransferPacket) -> Result<(), CoreError> {
            Ok(())
        }
        async fn close(&self) {}
        fn remote_addr(&self) -> String {
            "127.0.0.1:0".into()
        }
    }

    struct LoopbackBroker;
    #[async_trait]
    impl Broker for LoopbackBroker {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), CoreError> {
            Ok(())
        }
        async fn subscribe(&self, _topic: &str) -> Result<tokio::sync::mpsc::Receiver<InboundMessage>, CoreError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
        async fn unsubscribe(&self, _topic: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct UnreachableNodeDirectory;
    #[async_trait]
    impl NodeDirectory for UnreachableNodeDirectory {
        async fn grpc_address(&self, _node_id: &str) -> Result<String, CoreError> {
            Err(CoreError::not_configured("unused in this test"))
        }
    }

    struct FakeCloudControl {
        mappings: Mutex<Vec<PortMapping>>,
    }

    #[async_trait]
    impl CloudControl for FakeCloudControl {
        async fn authenticate(&self, _client_id: i64, _plaintext_secret: &[u8]) -> Result<bool, CoreError> {
            Ok(true)
        }
        async fn get_client(&self, _client_id: i64) -> Result<Option<ClientSummary>, CoreError> {
            Ok(None)
        }
        async fn get_client_config(&self, _client_id: i64) -> Result<Option<ClientConfig>, CoreError> {
            Ok(None)
        }
        async fn generate_anonymous_credentials(&self) -> Result<AnonymousBootstrap, CoreError> {
            Err(CoreError::not_configured("unused in this test"))
        }
        async fn get_port_mapping(&self, mapping_id: &str) -> Result<Option<PortMapping>, CoreError> {
            Ok(self.mappings.lock().iter().find(|m| m.id == mapping_id).cloned())
        }
        async fn get_client_port_mappings(&self, client_id: i64) -> Result<Vec<PortMapping>, CoreError> {
            Ok(self.mappings.lock().iter().filter(|m| m.authorizes(client_id)).cloned().collect())
        }
        async fn delete_port_mapping(&self, _client_id: i64, mapping_id: &str) -> Result<(), CoreError> {
            self.mappings.lock().retain(|m| m.id != mapping_id);
            Ok(())
        }
        async fn create_port_mapping(
            &self,
            listen_client_id: i64,
            target_client_id: i64,
            protocol: &str,
            target_host: &str,
            target_port: u16,
        ) -> Result<PortMapping, CoreError> {
            let mapping = PortMapping {
                id: format!("map-{listen_client_id}-{target_client_id}"),
                secret_key: "generated-secret".into(),
                listen_client_id,
                target_client_id,
                protocol: protocol.to_string(),
                target_host: target_host.to_string(),
                target_port,
                status: MappingStatus::Active,
                expires_at: None,
            };
            self.mappings.lock().push(mapping.clone());
            Ok(mapping)
        }
        async fn connect_client(
            &self,
            _client_id: i64,
            _node_id: &str,
            _conn_id: &str,
            _remote_ip: &str,
            _protocol: &str,
            _version: &str,
        ) -> Result<(), CoreError> {
            Ok(())
        }
        async fn validate_tunnel_resume_token(&self, _token: &str) -> Result<TunnelState, CoreError> {
            Err(CoreError::state_expired("unused in this test"))
        }
    }

    fn control_conn(conn_id: &str, client_id: i64) -> Arc<ControlConnection> {
        let conn = Arc::new(ControlConnection::new(conn_id.to_string(), "127.0.0.1:1".into(), "tcp".into(), Arc::new(NoopSink)));
        conn.mark_authenticated(client_id, None);
        conn
    }

    fn broker_with(cloud_control: Arc<dyn CloudControl>, control_registry: Arc<ControlRegistry>, tunnel_registry: Arc<TunnelRegistry>) -> Arc<TunnelBroker> {
        let state_store = Arc::new(TunnelStateStore::new(Arc::new(MemKv::default()), Some(b"state-secret".to_vec()), Duration::from_secs(300)));
        let resume_manager = Arc::new(ResumeManager::new(state_store, Some(b"resume-secret".to_vec()), Timeouts::default()));

        Arc::new(TunnelBroker::new(
            cloud_control,
            control_registry,
            tunnel_registry,
            Arc::new(CommandDispatcher::new(Duration::from_secs(1))),
            Arc::new(BridgeAdapter::new(Arc::new(LoopbackBroker), "node-a")),
            Arc::new(BridgeService::new()),
            Arc::new(UnreachableNodeDirectory),
            resume_manager,
            Timeouts {
                tunnel_ready_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn generate_then_activate_creates_a_mapping() {
        let registry = Arc::new(ControlRegistry::new(100));
        let owner = control_conn("conn-owner", 10_000_001);
        let activator = control_conn("conn-activator", 10_000_002);
        registry.register(owner.clone()).unwrap();
        registry.register(activator.clone()).unwrap();

        let codes = Arc::new(ConnectionCodeStore::new(Arc::new(MemKv::default())));
        let cloud_control: Arc<dyn CloudControl> = Arc::new(FakeCloudControl { mappings: Mutex::new(vec![]) });

        let generate = ConnectionCodeGenerateHandler {
            registry: registry.clone(),
            codes: codes.clone(),
        };
        let body = serde_json::to_string(&ConnectionCodeGenerateRequest {
            protocol: "tcp".into(),
            target_host: "127.0.0.1".into(),
            target_port: 22,
        })
        .unwrap();
        let HandlerOutcome::Reply(resp) = generate.handle("conn-owner", &body).await.unwrap() else {
            panic!("expected a reply");
        };
        let generated: ConnectionCodeGenerateResponse = serde_json::from_str(&resp).unwrap();

        let activate = ConnectionCodeActivateHandler {
            registry,
            codes,
            cloud_control,
        };
        let body = serde_json::to_string(&ConnectionCodeActivateRequest { code: generated.code }).unwrap();
        let HandlerOutcome::Reply(resp) = activate.handle("conn-activator", &body).await.unwrap() else {
            panic!("expected a reply");
        };
        let activated: ConnectionCodeActivateResponse = serde_json::from_str(&resp).unwrap();
        assert_eq!(activated.mapping_id, "map-10000001-10000002");
    }

    #[tokio::test]
    async fn owner_cannot_activate_their_own_code() {
        let registry = Arc::new(ControlRegistry::new(100));
        let owner = control_conn("conn-owner", 10_000_001);
        registry.register(owner.clone()).unwrap();

        let codes = Arc::new(ConnectionCodeStore::new(Arc::new(MemKv::default())));
        let cloud_control: Arc<dyn CloudControl> = Arc::new(FakeCloudControl { mappings: Mutex::new(vec![]) });

        let generate = ConnectionCodeGenerateHandler {
            registry: registry.clone(),
            codes: codes.clone(),
        };
        let body = serde_json::to_string(&ConnectionCodeGenerateRequest {
            protocol: "tcp".into(),
            target_host: "127.0.0.1".into(),
            target_port: 22,
        })
        .unwrap();
        let HandlerOutcome::Reply(resp) = generate.handle("conn-owner", &body).await.unwrap() else {
            panic!("expected a reply");
        };
        let generated: ConnectionCodeGenerateResponse = serde_json::from_str(&resp).unwrap();

        let activate = ConnectionCodeActivateHandler { registry, codes, cloud_control };
        let body = serde_json::to_string(&ConnectionCodeActivateRequest { code: generated.code }).unwrap();
        let err = activate.handle("conn-owner", &body).await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn tunnel_open_then_ready_enters_streaming() {
        let registry = Arc::new(ControlRegistry::new(100));
        let mapping = PortMapping {
            id: "map-1".into(),
            secret_key: "s3cret".into(),
            listen_client_id: 10_000_001,
            target_client_id: 10_000_002,
            protocol: "tcp".into(),
            target_host: "127.0.0.1".into(),
            target_port: 8080,
            status: MappingStatus::Active,
            expires_at: None,
        };
        let cloud_control: Arc<dyn CloudControl> = Arc::new(FakeCloudControl {
            mappings: Mutex::new(vec![mapping]),
        });
        let tunnel_registry = Arc::new(TunnelRegistry::new(100));
        let broker = broker_with(cloud_control, registry.clone(), tunnel_registry.clone());

        let conn = control_conn("conn-a", 10_000_001);
        registry.register(conn.clone()).unwrap();

        let open_handler = TunnelOpenRequestHandler {
            registry: registry.clone(),
            broker: broker.clone(),
        };
        let body = serde_json::to_string(&TunnelOpenRequest {
            tunnel_id: "tun-1".into(),
            resume_token: None,
            mapping_id: Some("map-1".into()),
            secret_key: None,
            target_host: None,
            target_port: None,
            sequence_numbers_enabled: false,
        })
        .unwrap();
        let HandlerOutcome::Reply(resp) = open_handler.handle("conn-a", &body).await.unwrap() else {
            panic!("expected a reply");
        };
        let opened: TunnelOpenResponse = serde_json::from_str(&resp).unwrap();
        assert_eq!(opened.tunnel_id, "tun-1");

        let ready_handler = TunnelOpenReadyHandler {
            registry,
            tunnel_registry,
        };
        let body = serde_json::to_string(&TunnelOpenReady { tunnel_id: "tun-1".into() }).unwrap();
        let outcome = ready_handler.handle("conn-a", &body).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::EnterStreaming(id) if id == "tun-1"));
    }

    #[tokio::test]
    async fn ready_is_rejected_for_a_connection_that_does_not_own_the_tunnel() {
        let registry = Arc::new(ControlRegistry::new(100));
        let tunnel_registry = Arc::new(TunnelRegistry::new(100));
        let conn = control_conn("conn-a", 10_000_001);
        registry.register(conn).unwrap();

        let ready_handler = TunnelOpenReadyHandler { registry, tunnel_registry };
        let body = serde_json::to_string(&TunnelOpenReady { tunnel_id: "no-such-tunnel".into() }).unwrap();
        let err = ready_handler.handle("conn-a", &body).await.unwrap_err();
        assert_eq!(err.code, tunnox_types::ErrorCode::Unauthorized);
    }
}
