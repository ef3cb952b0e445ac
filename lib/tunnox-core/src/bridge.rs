//! Cross-node bridge adapter (C8, spec §4.8). Publishes tunnel-open/ready
//! rendez-vous events on the injected `Broker`, and once the owning node is
//! known, dials its `TunnelBridge` gRPC service (the `tonic`-generated
//! client from `proto/bridge.proto`) to splice raw bytes across the node
//! boundary. Grounded on the client-dial shape of `betcode`'s tunnel client
//! (`mpsc` sender feeding a `ReceiverStream` as the outbound half, a
//! `Streaming<T>` response as the inbound half) from the example pack, the
//! closest fit to this exact client-dials-a-bidi-stream pattern.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use tunnox_types::CoreError;

use crate::bridge_proto::tunnel_bridge_client::TunnelBridgeClient;
use crate::bridge_proto::tunnel_bridge_server::{TunnelBridge, TunnelBridgeServer};
use crate::bridge_proto::BridgeFrame;
use crate::connection::TunnelDuplex;
use crate::contracts::Broker;

pub const TOPIC_TUNNEL_OPEN: &str = "tunnox.tunnel_open";
pub const TOPIC_TUNNEL_READY: &str = "tunnox.tunnel_ready";

/// §4.7 payload published on `tunnox.tunnel_open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenMessage {
    pub tunnel_id: String,
    pub target_client_id: i64,
    pub mapping_id: Option<String>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub timestamp: i64,
}

/// §4.7/§4.8 payload published on `tunnox.tunnel_ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelReadyMessage {
    pub tunnel_id: String,
    pub source_node_id: String,
    pub timestamp: i64,
}

pub struct BridgeAdapter {
    broker: Arc<dyn Broker>,
    node_id: String,
}

impl BridgeAdapter {
    pub fn new(broker: Arc<dyn Broker>, node_id: impl Into<String>) -> Self {
        BridgeAdapter {
            broker,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn broadcast_tunnel_open(&self, msg: &TunnelOpenMessage) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(msg).map_err(|e| CoreError::internal(e.to_string()))?;
        self.broker.publish(TOPIC_TUNNEL_OPEN, payload).await
    }

    pub async fn notify_tunnel_ready(&self, tunnel_id: &str) -> Result<(), CoreError> {
        let msg = TunnelReadyMessage {
            tunnel_id: tunnel_id.to_string(),
            source_node_id: self.node_id.clone(),
            timestamp: tunnox_common::time::timestamp_secs(),
        };
        let payload = serde_json::to_vec(&msg).map_err(|e| CoreError::internal(e.to_string()))?;
        self.broker.publish(TOPIC_TUNNEL_READY, payload).await
    }

    /// Subscribes *before* returning so the caller can publish the
    /// triggering event without losing the race (Design Notes §9: "the
    /// implementation must subscribe before publishing"). Drains unrelated
    /// `tunnel_ready` messages while waiting for the one whose `tunnelID`
    /// matches.
    pub async fn wait_for_tunnel_ready(&self, tunnel_id: &str, wait: Duration) -> Result<String, CoreError> {
        let mut rx = self.broker.subscribe(TOPIC_TUNNEL_READY).await?;
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::timeout(format!("no tunnel_ready for {tunnel_id} within {wait:?}")));
            }

            let inbound = match timeout(remaining, rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(CoreError::network_error("broker subscription closed")),
                Err(_) => return Err(CoreError::timeout(format!("no tunnel_ready for {tunnel_id} within {wait:?}"))),
            };

            let ready: TunnelReadyMessage = match serde_json::from_slice(&inbound.payload) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "discarding malformed tunnel_ready message");
                    continue;
                }
            };

            if ready.tunnel_id == tunnel_id {
                return Ok(ready.source_node_id);
            }
            debug!(tunnel_id = %ready.tunnel_id, "ignoring tunnel_ready for a different tunnel while waiting");
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<crate::contracts::InboundMessage>, CoreError> {
        self.broker.subscribe(topic).await
    }

    pub async fn publish_message(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        self.broker.publish(topic, payload).await
    }

    /// Dials `node_addr`'s `TunnelBridge` service and opens a bidirectional
    /// stream for `tunnel_id`, returning a byte duplex the broker can splice
    /// exactly like a same-node `TunnelConnection`'s transport duplex.
    pub async fn open_stream(&self, node_addr: &str, tunnel_id: &str) -> Result<Box<dyn TunnelDuplex>, CoreError> {
        let channel = Channel::from_shared(node_addr.to_string())
            .map_err(|e| CoreError::network_error(format!("invalid bridge node address {node_addr}: {e}")))?
            .connect()
            .await
            .map_err(|e| CoreError::network_error(format!("failed to dial bridge node {node_addr}: {e}")))?;

        let mut client = TunnelBridgeClient::new(channel);
        let (outbound_tx, outbound_rx) = mpsc::channel::<BridgeFrame>(64);

        let response = client
            .open_stream(Request::new(ReceiverStream::new(outbound_rx)))
            .await
            .map_err(|e| CoreError::network_error(format!("bridge OpenStream rejected: {e}")))?;

        Ok(Box::new(pump_into_duplex(tunnel_id.to_string(), response.into_inner(), outbound_tx)))
    }
}

/// Spawns the task that pumps `BridgeFrame`s in both directions between the
/// gRPC stream and a local `tokio::io::duplex`, and returns the local half
/// as a plain byte duplex. Isolates the framing detail from the generic
/// splice code in `broker.rs`, which only knows about `AsyncRead`/`AsyncWrite`.
fn pump_into_duplex(
    tunnel_id: String,
    mut inbound: Streaming<BridgeFrame>,
    outbound_tx: mpsc::Sender<BridgeFrame>,
) -> impl TunnelDuplex {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::spawn({
        let tunnel_id = tunnel_id.clone();
        async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if remote_write.write_all(&frame.data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%tunnel_id, error = %err, "bridge inbound stream error");
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = BridgeFrame {
                        tunnel_id: tunnel_id.clone(),
                        data: buf[..n].to_vec(),
                    };
                    if outbound_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    local
}

/// Server side of the bridge: accepted on the node that owns the peer side
/// of a cross-node tunnel. Looks the tunnel up in the local `TunnelRegistry`
/// once both frames start flowing and splices the gRPC stream against that
/// side's transport duplex the same way the broker splices two local sides.
pub struct BridgeService {
    /// Handed to `connection::TunnelConnection::install_duplex` by the
    /// broker once a tunnel has been authorized locally but is still
    /// waiting on an inbound gRPC dial; keyed by `tunnelID`.
    waiters: dashmap::DashMap<String, mpsc::Sender<Box<dyn TunnelDuplex>>>,
}

impl Default for BridgeService {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeService {
    pub fn new() -> Self {
        BridgeService {
            waiters: dashmap::DashMap::new(),
        }
    }

    /// Registers a one-shot waiter so that when the inbound `OpenStream`
    /// call for `tunnel_id` arrives, its duplex is handed back to whoever is
    /// brokering that tunnel locally (spec §4.7 cross-node path).
    pub fn register_waiter(&self, tunnel_id: String) -> mpsc::Receiver<Box<dyn TunnelDuplex>> {
        let (tx, rx) = mpsc::channel(1);
        self.waiters.insert(tunnel_id, tx);
        rx
    }

    pub fn into_server(self: Arc<Self>) -> TunnelBridgeServer<Arc<Self>> {
        TunnelBridgeServer::new(self)
    }
}

#[tonic::async_trait]
impl TunnelBridge for Arc<BridgeService> {
    type OpenStreamStream = ReceiverStream<Result<BridgeFrame, Status>>;

    async fn open_stream(&self, request: Request<Streaming<BridgeFrame>>) -> Result<Response<Self::OpenStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await
            .map_err(|e| Status::internal(format!("reading first bridge frame: {e}")))?
            .ok_or_else(|| Status::invalid_argument("bridge stream closed before sending a frame"))?;
        let tunnel_id = first.tunnel_id.clone();

        let Some(waiter) = self.waiters.get(&tunnel_id).map(|e| e.clone()) else {
            return Err(Status::not_found(format!("no local tunnel waiting for bridge {tunnel_id}")));
        };
        self.waiters.remove(&tunnel_id);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Result<BridgeFrame, Status>>(64);
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        if remote_write.write_all(&first.data).await.is_err() {
            return Err(Status::internal("failed delivering first bridge frame locally"));
        }

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if remote_write.write_all(&frame.data).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });

        tokio::spawn({
            let tunnel_id = tunnel_id.clone();
            async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    match remote_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let frame = BridgeFrame {
                                tunnel_id: tunnel_id.clone(),
                                data: buf[..n].to_vec(),
                            };
                            if outbound_tx.send(Ok(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let _ = waiter.send(Box::new(local)).await;

        Ok(Response::new(ReceiverStream::new(outbound_rx)))
    }
}
