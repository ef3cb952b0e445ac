//! Reference server binary: wires the Tunnox session layer (`tunnox-core`)
//! to a plain TCP transport and an in-memory cloud-control plane
//! (`tunnox-cloud-control`), and exposes the inter-node gRPC bridge. This is
//! "the minimal binary a reader needs to see the whole system run"
//! (`SPEC_FULL.md` §A) — a production deployment replaces the transport and
//! the cloud-control plane, not the core.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};

use tunnox_core::auth::Authenticator;
use tunnox_core::bridge::{BridgeAdapter, BridgeService};
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

use tunnox_cloud_control::{AllowAllIpPolicy, FixedWindowAnonymousRateLimiter, FixedWindowBruteForceGuard, InMemoryBroker, InMemoryCloudControl, InMemoryKv, StaticNodeDirectory};

#[derive(Parser, Debug)]
#[command(name = "tunnox-node", version, about = "Tunnox reverse-tunnel server node")]
struct Cli {
    /// Path to the node's TOML config file.
    #[arg(long, default_value = "tunnox-node.toml")]
    config: PathBuf,

    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tunnox_common::logging::init("tunnox=info,warn");

    let cli = Cli::parse();
    let mut node_config = config::NodeConfig::load(&cli.config)?;
    if let Some(addr) = cli.listen_addr {
        node_config.listen_addr = addr;
    }

    if node_config.is_cluster_mode() && (node_config.state_secret.is_empty() || node_config.resume_secret.is_empty()) {
        // Spec §4.3: "implementations must refuse to start in cluster mode
        // without an explicit secret."
        anyhow::bail!("cluster mode requires explicit state_secret and resume_secret in the config file");
    }
    if node_config.state_secret.is_empty() || node_config.resume_secret.is_empty() {
        warn!("no signing secret configured; falling back to a fixed development secret (unsafe for production)");
    }

    let limits = ResourceLimits {
        max_base_connections: node_config.limits.max_base_connections,
        max_control_connections: node_config.limits.max_control_connections,
        ..ResourceLimits::default()
    };
    let timeouts = Timeouts::default();

    let kv = Arc::new(InMemoryKv::new());
    let state_store = Arc::new(TunnelStateStore::new(kv.clone(), Some(node_config.state_secret_bytes()), timeouts.tunnel_state_ttl));
    let resume_manager = Arc::new(ResumeManager::new(state_store.clone(), Some(node_config.resume_secret_bytes()), timeouts));

    let cloud_control = Arc::new(InMemoryCloudControl::new(state_store.clone(), node_config.resume_secret_bytes()));
    for (client_id, secret) in node_config.client_roster() {
        cloud_control.register_client(client_id, secret.as_bytes(), false, None);
    }
    let cloud_control: Arc<dyn CloudControl> = cloud_control;

    let control_registry = Arc::new(ControlRegistry::new(limits.max_control_connections));
    let tunnel_registry = Arc::new(TunnelRegistry::new(limits.max_control_connections));
    let dispatcher = Arc::new(CommandDispatcher::new(timeouts.request_timeout));
    let codes = Arc::new(ConnectionCodeStore::new(kv.clone()));

    let in_memory_broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(node_config.node_id.clone()));
    let bridge_adapter = Arc::new(BridgeAdapter::new(in_memory_broker, node_config.node_id.clone()));
    let bridge_service = Arc::new(BridgeService::new());
    let node_directory = Arc::new(StaticNodeDirectory::new(Default::default()));

    let authenticator = Arc::new(Authenticator::new(
        cloud_control.clone(),
        Arc::new(AllowAllIpPolicy),
        Arc::new(FixedWindowBruteForceGuard::new(5, Duration::from_secs(15 * 60))),
        Arc::new(FixedWindowAnonymousRateLimiter::new(20, Duration::from_secs(60))),
        AuthConfig::default(),
    ));

    let broker = Arc::new(tunnox_core::broker::TunnelBroker::new(
        cloud_control.clone(),
        control_registry.clone(),
        tunnel_registry.clone(),
        dispatcher.clone(),
        bridge_adapter,
        bridge_service.clone(),
        node_directory,
        resume_manager.clone(),
        timeouts,
    ));

    register_handlers(&dispatcher, control_registry.clone(), tunnel_registry.clone(), broker.clone(), cloud_control, codes);

    let session = SessionManager::new(control_registry, dispatcher, authenticator, broker.clone(), resume_manager.clone(), limits, timeouts);

    let _cleanup = session.spawn_cleanup_task();
    let _cross_node = broker.spawn_cross_node_listener();
    // C10 (spec §4.10): periodically snapshot every active tunnel's send
    // buffer so a client reconnecting within the state TTL can resume.
    let _resume_capture = resume_manager.spawn_periodic_capture(tunnel_registry.clone(), Duration::from_secs(30));

    let bridge_addr: SocketAddr = node_config.bridge_listen_addr.parse()?;
    let bridge_server = bridge_service.into_server();
    let grpc = tokio::spawn(async move {
        if let Err(err) = Server::builder().add_service(bridge_server).serve(bridge_addr).await {
            warn!(error = %err, "bridge gRPC server exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(&node_config.listen_addr).await?;
    info!(node_id = %node_config.node_id, addr = %node_config.listen_addr, bridge_addr = %bridge_addr, "tunnox-node listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                let session = session.clone();
                tokio::spawn(async move {
                    session.serve_connection(remote_addr.to_string(), "tcp".to_string(), reader, writer).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, beginning graceful shutdown");
                session.begin_shutdown();
                break;
            }
        }
    }

    grpc.abort();
    Ok(())
}
