//! Tunnel broker (C7, spec §4.7). Authorizes a `TUNNEL_OPEN` against one of
//! the three paths (resume token, mapping ID, mapping ID + secret key),
//! registers this side in the `TunnelRegistry`, notifies the peer — locally
//! via the command dispatcher or across the cluster via the bridge adapter
//! (C8) — and once both sides have handed over a byte duplex, splices them.
//!
//! Grounded on the teacher's `system` module for the "one coordinator owns
//! several collaborating stores" shape, generalized here from a fixed tick
//! loop to one async method per inbound `TUNNEL_OPEN`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tunnox_types::{CoreError, PortMapping, TunnelOpenRequest, TunnelState};

use crate::bridge::{BridgeAdapter, BridgeService, TunnelOpenMessage, TOPIC_TUNNEL_OPEN};
use crate::config::Timeouts;
use crate::connection::{ControlConnection, SpliceRole, TunnelConnection, TunnelLifecycle};
use crate::contracts::{CloudControl, NodeDirectory};
use crate::dispatch::CommandDispatcher;
use crate::registry::ControlRegistry;
use crate::resume::ResumeManager;
use crate::tunnels::TunnelRegistry;

/// Which `TUNNEL_OPEN` field set authorized this side, carried alongside the
/// things the splice needs once its duplex is attached (spec §4.7).
struct Authorization {
    peer_client_id: i64,
    mapping_id: Option<String>,
    restore: Option<TunnelState>,
}

/// Whether the peer is already known to be local, decided once at
/// authorization time and consulted again once this side's duplex is
/// attached (see `SpliceRole`).
enum PeerLocation {
    SameNode,
    CrossNode,
}

#[derive(Clone)]
pub struct TunnelBroker {
    cloud_control: Arc<dyn CloudControl>,
    control_registry: Arc<ControlRegistry>,
    tunnel_registry: Arc<TunnelRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    bridge: Arc<BridgeAdapter>,
    bridge_service: Arc<BridgeService>,
    node_directory: Arc<dyn NodeDirectory>,
    resume_manager: Arc<ResumeManager>,
    timeouts: Timeouts,
    /// `tunnelID`s this node has learned about only via an inbound
    /// `tunnox.tunnel_open` broadcast (spec §4.7 cross-node path) — i.e.
    /// this node owns the *other* client and must respond rather than
    /// initiate. Populated by `spawn_cross_node_listener`, consumed by
    /// `handle_tunnel_open` the moment the locally-notified client opens its
    /// own tunnel connection.
    responder_tunnels: Arc<DashSet<String>>,
}

impl TunnelBroker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cloud_control: Arc<dyn CloudControl>,
        control_registry: Arc<ControlRegistry>,
        tunnel_registry: Arc<TunnelRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        bridge: Arc<BridgeAdapter>,
        bridge_service: Arc<BridgeService>,
        node_directory: Arc<dyn NodeDirectory>,
        resume_manager: Arc<ResumeManager>,
        timeouts: Timeouts,
    ) -> Self {
        TunnelBroker {
            cloud_control,
            control_registry,
            tunnel_registry,
            dispatcher,
            bridge,
            bridge_service,
            node_directory,
            resume_manager,
            timeouts,
            responder_tunnels: Arc::new(DashSet::new()),
        }
    }

    pub fn bridge_service(&self) -> Arc<BridgeService> {
        self.bridge_service.clone()
    }

    /// Subscribes to `tunnox.tunnel_open` for the lifetime of the server
    /// (spec §4.7/§4.8 cross-node path). For every broadcast naming a
    /// `targetClientID` with a control connection on *this* node, pushes a
    /// `TUNNEL_OPEN_REQUEST` to that client and remembers the tunnel as one
    /// this node must respond to rather than initiate. Broadcasts for a
    /// tunnel this node already has a local side for (i.e. the one it
    /// published itself) are ignored — exactly one node initiates.
    pub fn spawn_cross_node_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut rx = match broker.bridge.subscribe(TOPIC_TUNNEL_OPEN).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(error = %err, "cross-node listener failed to subscribe to tunnel_open");
                    return;
                }
            };

            while let Some(inbound) = rx.recv().await {
                let msg: TunnelOpenMessage = match serde_json::from_slice(&inbound.payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(error = %err, "discarding malformed tunnel_open message");
                        continue;
                    }
                };

                if !broker.tunnel_registry.sides(&msg.tunnel_id).is_empty() {
                    // We already have a local side for this tunnel — we are
                    // the node that published this broadcast, not a responder.
                    continue;
                }

                let Some(peer_conn) = broker.control_registry.get_by_client_id(msg.target_client_id) else {
                    continue;
                };

                debug!(tunnel_id = %msg.tunnel_id, target_client_id = msg.target_client_id, "reacting to remote tunnel_open as responder");
                broker.responder_tunnels.insert(msg.tunnel_id.clone());

                let req = TunnelOpenRequest {
                    tunnel_id: msg.tunnel_id.clone(),
                    resume_token: None,
                    mapping_id: msg.mapping_id.clone(),
                    secret_key: None,
                    target_host: msg.target_host.clone(),
                    target_port: msg.target_port,
                    sequence_numbers_enabled: false,
                };
                broker.notify_same_node_peer(&peer_conn, &req);
            }
        })
    }

    /// Entry point for the `TUNNEL_OPEN_REQUEST` handler (`handlers.rs`).
    /// Authorizes `req`, registers this side of the tunnel, and notifies the
    /// peer. Returns the resume token for this tunnel once the caller should
    /// reply and switch the connection into streaming mode (spec §4.9 Design
    /// Notes) — pairing and splicing continue in the background via
    /// `attach_local_duplex`.
    ///
    /// The token is minted here, while the framed control channel is still
    /// alive to carry it back to the client, rather than at suspend time —
    /// by the time a tunnel's duplex breaks there is no framed channel left
    /// to deliver a freshly minted token over (see `DESIGN.md`). The
    /// `TunnelState` the token ultimately resolves to is kept fresh
    /// independently, by `wait_and_splice`'s teardown capture and by
    /// `ResumeManager::spawn_periodic_capture`.
    pub async fn handle_tunnel_open(&self, conn: &Arc<ControlConnection>, req: TunnelOpenRequest) -> Result<String, CoreError> {
        let client_id = conn
            .client_id()
            .ok_or_else(|| CoreError::unauthorized("tunnel open requires an authenticated connection"))?;

        let auth = self.authorize(client_id, &req).await?;

        let tunnel_conn = Arc::new(TunnelConnection::new(
            req.tunnel_id.clone(),
            conn.conn_id.clone(),
            auth.mapping_id.clone(),
            client_id,
            auth.peer_client_id,
            req.sequence_numbers_enabled,
            conn.sink.clone(),
        ));
        tunnel_conn.set_state(TunnelLifecycle::Authorized);

        if let Some(state) = &auth.restore {
            tunnel_conn.with_send_buffer(|buf| buf.restore(state.last_seq_num + 1, state.buffered_packets.clone()));
            tunnel_conn.with_receive_buffer(|buf| buf.restore(state.next_expected_seq));
        }

        let completed_pair = self.tunnel_registry.register(tunnel_conn.clone())?;

        let location = if let Some(peer_conn) = self.control_registry.get_by_client_id(auth.peer_client_id) {
            tunnel_conn.set_splice_role(if completed_pair {
                SpliceRole::SameNodeDriver
            } else {
                SpliceRole::SameNodeCooperator
            });
            self.notify_same_node_peer(&peer_conn, &req);
            PeerLocation::SameNode
        } else if self.responder_tunnels.remove(&req.tunnel_id).is_some() {
            tunnel_conn.set_splice_role(SpliceRole::CrossNodeResponder);
            self.bridge.notify_tunnel_ready(&req.tunnel_id).await?;
            PeerLocation::CrossNode
        } else {
            tunnel_conn.set_splice_role(SpliceRole::CrossNodeInitiator);
            self.notify_cross_node_peer(&req, &auth).await?;
            PeerLocation::CrossNode
        };

        info!(tunnel_id = %req.tunnel_id, conn_id = %conn.conn_id, "tunnel authorized, awaiting pairing");

        let broker = self.clone();
        let tunnel_id = req.tunnel_id.clone();
        let conn_id = conn.conn_id.clone();
        tokio::spawn(async move {
            broker.wait_and_splice(tunnel_id, conn_id, location).await;
        });

        Ok(self.resume_manager.issue_resume_token(&req.tunnel_id))
    }

    /// Called by the session manager (C9) once it has stopped reading framed
    /// packets on `conn_id` and has a raw byte duplex ready for splicing
    /// (spec §4.9 Design Notes: "the packet loop's only responsibility is to
    /// stop reading and hand off").
    pub fn attach_local_duplex(&self, tunnel_id: &str, conn_id: &str, duplex: Box<dyn crate::connection::TunnelDuplex>) {
        let Some(tunnel_conn) = self.tunnel_registry.sides(tunnel_id).into_iter().find(|c| c.conn_id == conn_id) else {
            warn!(tunnel_id, conn_id, "attach_local_duplex called for an unregistered tunnel side");
            return;
        };
        tunnel_conn.install_duplex(duplex);
    }

    async fn authorize(&self, client_id: i64, req: &TunnelOpenRequest) -> Result<Authorization, CoreError> {
        if let Some(token) = req.resume_token.as_deref() {
            return self.authorize_resume(client_id, req, token).await;
        }
        if let Some(mapping_id) = req.mapping_id.as_deref() {
            return match req.secret_key.as_deref() {
                Some(secret) => self.authorize_secret_key(client_id, mapping_id, secret).await,
                None => self.authorize_mapping_id(client_id, mapping_id).await,
            };
        }
        Err(CoreError::invalid_param(
            "tunnel open requires resumeToken, mappingID, or mappingID+secretKey",
        ))
    }

    async fn authorize_resume(&self, client_id: i64, req: &TunnelOpenRequest, token: &str) -> Result<Authorization, CoreError> {
        let state = self.cloud_control.validate_tunnel_resume_token(token).await?;
        if state.tunnel_id != req.tunnel_id {
            return Err(CoreError::unauthorized("resume token is for a different tunnel"));
        }
        if client_id != state.listen_client_id && client_id != state.target_client_id {
            return Err(CoreError::unauthorized("resume token does not belong to this client"));
        }

        let peer_client_id = if client_id == state.listen_client_id {
            state.target_client_id
        } else {
            state.listen_client_id
        };

        Ok(Authorization {
            peer_client_id,
            mapping_id: state.mapping_id.clone(),
            restore: Some(state),
        })
    }

    async fn authorize_mapping_id(&self, client_id: i64, mapping_id: &str) -> Result<Authorization, CoreError> {
        let mapping = self.load_active_mapping(mapping_id, client_id).await?;
        Ok(Authorization {
            peer_client_id: mapping.peer_of(client_id).expect("authorizes() already checked membership"),
            mapping_id: Some(mapping_id.to_string()),
            restore: None,
        })
    }

    async fn authorize_secret_key(&self, client_id: i64, mapping_id: &str, secret: &str) -> Result<Authorization, CoreError> {
        let mapping = self
            .cloud_control
            .get_port_mapping(mapping_id)
            .await?
            .ok_or_else(|| CoreError::mapping_not_found(format!("no such mapping {mapping_id}")))?;

        if !bool::from(mapping.secret_key.as_bytes().ct_eq(secret.as_bytes())) {
            return Err(CoreError::mapping_unauthorized("secret key does not match mapping"));
        }
        if !mapping.authorizes(client_id) {
            return Err(CoreError::mapping_unauthorized(
                "client is neither the listener nor the target of this mapping",
            ));
        }

        Ok(Authorization {
            peer_client_id: mapping.peer_of(client_id).expect("authorizes() already checked membership"),
            mapping_id: Some(mapping_id.to_string()),
            restore: None,
        })
    }

    async fn load_active_mapping(&self, mapping_id: &str, client_id: i64) -> Result<PortMapping, CoreError> {
        let mapping = self
            .cloud_control
            .get_port_mapping(mapping_id)
            .await?
            .ok_or_else(|| CoreError::mapping_not_found(format!("no such mapping {mapping_id}")))?;

        if mapping.is_expired(tunnox_common::time::timestamp_secs()) {
            return Err(CoreError::mapping_not_found("mapping is expired or disabled"));
        }
        if !mapping.authorizes(client_id) {
            return Err(CoreError::mapping_unauthorized(
                "client is neither the listener nor the target of this mapping",
            ));
        }
        Ok(mapping)
    }

    /// Best-effort push telling the peer's own client to open its side of
    /// the tunnel. The actual synchronization point is
    /// `TunnelRegistry::peer_side` (or the cross-node bridge), polled by
    /// `wait_and_splice` — a dropped or ignored notify just means the peer
    /// finds out some other way (e.g. it already initiated independently).
    fn notify_same_node_peer(&self, peer_conn: &Arc<ControlConnection>, req: &TunnelOpenRequest) {
        let Ok(body) = serde_json::to_string(req) else {
            warn!(tunnel_id = %req.tunnel_id, "failed to encode tunnel open notification");
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let peer_conn = peer_conn.clone();
        let command_type = tunnox_types::CommandType::TunnelOpenRequest as u16;
        tokio::spawn(async move {
            let sink = PeerPacketSink(peer_conn.clone());
            if let Err(err) = dispatcher
                .send_request(&sink, &peer_conn.conn_id, command_type, body, Some(Duration::from_secs(5)))
                .await
            {
                warn!(conn_id = %peer_conn.conn_id, error = %err, "peer did not acknowledge tunnel open notification");
            }
        });
    }

    async fn notify_cross_node_peer(&self, req: &TunnelOpenRequest, auth: &Authorization) -> Result<(), CoreError> {
        self.bridge
            .broadcast_tunnel_open(&TunnelOpenMessage {
                tunnel_id: req.tunnel_id.clone(),
                target_client_id: auth.peer_client_id,
                mapping_id: auth.mapping_id.clone(),
                target_host: req.target_host.clone(),
                target_port: req.target_port,
                timestamp: tunnox_common::time::timestamp_secs(),
            })
            .await
    }

    async fn wait_and_splice(&self, tunnel_id: String, conn_id: String, location: PeerLocation) {
        let local = match self.tunnel_registry.sides(&tunnel_id).into_iter().find(|c| c.conn_id == conn_id) {
            Some(c) => c,
            None => return,
        };

        let outcome = match location {
            PeerLocation::SameNode => self.splice_same_node(&tunnel_id, &local).await,
            PeerLocation::CrossNode => self.splice_cross_node(&tunnel_id, &local).await,
        };

        if let Err(err) = outcome {
            warn!(tunnel_id = %tunnel_id, conn_id = %conn_id, error = %err, "tunnel pairing failed; tearing down");
        }

        // Whether the splice ended cleanly or not, refresh the persisted
        // state one last time so a client that still holds the resume token
        // minted at open time can pick the tunnel back up (spec §4.10).
        if let Err(err) = self.resume_manager.suspend(&local).await {
            warn!(tunnel_id = %tunnel_id, conn_id = %conn_id, error = %err, "failed to capture tunnel state on teardown");
        }

        self.tunnel_registry.remove_side(&tunnel_id, &conn_id);
    }

    async fn splice_same_node(&self, tunnel_id: &str, local: &Arc<TunnelConnection>) -> Result<(), CoreError> {
        if local.splice_role() != Some(SpliceRole::SameNodeDriver) {
            // Cooperator: the driver reaches into the registry and takes
            // this side's duplex directly. Stay registered until that has
            // happened (state flips to `Streaming`) so there is something
            // for it to take, then let the caller clean up this entry — the
            // copy itself no longer touches the registry once under way.
            self.poll_until(self.timeouts.tunnel_ready_timeout, || {
                matches!(local.state(), TunnelLifecycle::Streaming | TunnelLifecycle::Closed).then_some(())
            })
            .await;
            return Ok(());
        }

        let peer = self
            .poll_until(self.timeouts.tunnel_ready_timeout, || self.tunnel_registry.peer_side(tunnel_id, &local.conn_id))
            .await
            .ok_or_else(|| CoreError::timeout(format!("no peer appeared for tunnel {tunnel_id} in time")))?;

        let mut local_duplex = self
            .poll_until(self.timeouts.tunnel_ready_timeout, || local.take_duplex())
            .await
            .ok_or_else(|| CoreError::internal("local duplex was never attached before the pairing deadline"))?;
        let mut peer_duplex = self
            .poll_until(self.timeouts.tunnel_ready_timeout, || peer.take_duplex())
            .await
            .ok_or_else(|| CoreError::internal("peer duplex was never attached before the pairing deadline"))?;

        local.set_state(TunnelLifecycle::Streaming);
        peer.set_state(TunnelLifecycle::Streaming);
        info!(tunnel_id, "same-node tunnel paired, splicing");

        tokio::io::copy_bidirectional(&mut local_duplex, &mut peer_duplex)
            .await
            .map_err(|e| CoreError::network_error(e.to_string()))?;
        Ok(())
    }

    /// Splices the local side of a cross-node tunnel against a bridge
    /// duplex. The two `SpliceRole`s this covers dial in opposite
    /// directions: the initiator waits for `tunnel_ready` and dials the
    /// responder's node; the responder registers a waiter with its own
    /// `BridgeService` and waits for the initiator's node to dial in (spec
    /// §4.7/§4.8).
    async fn splice_cross_node(&self, tunnel_id: &str, local: &Arc<TunnelConnection>) -> Result<(), CoreError> {
        let mut local_duplex = self
            .poll_until(self.timeouts.tunnel_ready_timeout, || local.take_duplex())
            .await
            .ok_or_else(|| CoreError::internal("local duplex was never attached before the pairing deadline"))?;

        let mut remote_duplex = match local.splice_role() {
            Some(SpliceRole::CrossNodeResponder) => {
                let mut waiter = self.bridge_service.register_waiter(tunnel_id.to_string());
                tokio::time::timeout(self.timeouts.tunnel_ready_timeout, waiter.recv())
                    .await
                    .map_err(|_| CoreError::timeout(format!("no inbound bridge dial for tunnel {tunnel_id} in time")))?
                    .ok_or_else(|| CoreError::network_error("bridge waiter channel closed before a dial arrived"))?
            }
            _ => {
                let node_id = self.bridge.wait_for_tunnel_ready(tunnel_id, self.timeouts.tunnel_ready_timeout).await?;
                let addr = self.node_directory.grpc_address(&node_id).await?;
                self.bridge.open_stream(&addr, tunnel_id).await?
            }
        };

        local.set_state(TunnelLifecycle::Streaming);
        info!(tunnel_id, "cross-node tunnel paired, splicing");

        tokio::io::copy_bidirectional(&mut local_duplex, &mut remote_duplex)
            .await
            .map_err(|e| CoreError::network_error(e.to_string()))?;
        Ok(())
    }

    /// Polls `probe` every 25ms up to `deadline`, used for the in-process
    /// rendez-vous points (peer registration, duplex attachment) that have
    /// no cheap async notification source yet (see `DESIGN.md`).
    async fn poll_until<T>(&self, deadline: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let until = Instant::now() + deadline;
        loop {
            if let Some(value) = probe() {
                return Some(value);
            }
            if Instant::now() >= until {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Adapts a `ControlConnection`'s `ConnectionSink` to `PacketSink` so the
/// dispatcher can push the peer notification through the same `send_request`
/// path used for ordinary command calls.
struct PeerPacketSink(Arc<ControlConnection>);

#[async_trait::async_trait]
impl crate::dispatch::PacketSink for PeerPacketSink {
    async fn send(&self, _conn_id: &str, packet: tunnox_types::TransferPacket) -> Result<(), CoreError> {
        self.0.sink.send(packet).await
    }
}
