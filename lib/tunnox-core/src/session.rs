//! Session manager (C9, spec §4.9). Owns every other component and is the
//! one thing a transport adapter (out of scope, §1) actually calls: hand it
//! an accepted stream's reader/writer halves and it runs the whole
//! lifecycle — handshake, command dispatch, and the handoff into streaming
//! mode — until the stream closes.
//!
//! Grounded on the teacher's per-connection actor shape (one task owns a
//! socket, a channel feeds its writer side), adapted here into a writer task
//! reachable by an RPC-style channel so the same handle can either push a
//! framed packet or be asked to give the raw writer back for splicing.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use tunnox_types::{CommandPacket, CommandType, CoreError, GenericResponse, TransferPacket};

use crate::codec;
use crate::config::{ResourceLimits, Timeouts};
use crate::connection::{ConnectionSink, ControlConnection, ControlState};
use crate::dispatch::{CommandDispatcher, ExecuteOutcome};
use crate::registry::ControlRegistry;
use crate::resume::ResumeManager;
use crate::{auth::Authenticator, broker::TunnelBroker};

/// Plain counters, no metrics backend (`SPEC_FULL.md` §C: observability
/// stays inside `tracing` spans/events; these are for an operator CLI or a
/// `/debug/vars`-style endpoint a transport adapter can expose, not a
/// Prometheus exporter this crate does not depend on).
#[derive(Default)]
pub struct SessionStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub tunnels_opened: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub commands_dispatched: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub tunnels_opened: u64,
    pub handshake_failures: u64,
    pub commands_dispatched: u64,
}

enum WriterCommand {
    Packet(TransferPacket, oneshot::Sender<Result<(), CoreError>>),
    /// Reclaims the raw writer for splicing (spec §4.9 Design Notes: "the
    /// packet loop's only responsibility on entering streaming mode is to
    /// stop reading and hand off its duplex"). Ends the writer task.
    Detach(oneshot::Sender<Box<dyn AsyncWrite + Send + Unpin>>),
    Close,
}

async fn run_writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<WriterCommand>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Packet(packet, reply) => {
                let result = codec::write_packet(&mut writer, &packet).await.map(|_| ()).map_err(CoreError::from);
                let _ = reply.send(result);
            }
            WriterCommand::Detach(reply) => {
                let _ = reply.send(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>);
                return;
            }
            WriterCommand::Close => return,
        }
    }
}

/// `ConnectionSink` backed by the channel above rather than a raw socket, so
/// the same writer half can later be reclaimed whole for the tunnel splice.
struct ChannelSink {
    tx: mpsc::Sender<WriterCommand>,
    remote_addr: String,
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&self, packet: TransferPacket) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Packet(packet, reply_tx))
            .await
            .map_err(|_| CoreError::network_error("writer task is gone"))?;
        reply_rx.await.map_err(|_| CoreError::network_error("writer task dropped its reply"))?
    }

    async fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close).await;
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }
}

enum PacketOutcome {
    Continue,
    EnterStreaming(String),
}

fn parse_remote_ip(remote_addr: &str) -> IpAddr {
    remote_addr
        .rsplit_once(':')
        .and_then(|(host, _)| host.trim_matches(|c| c == '[' || c == ']').parse().ok())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

/// Owns the collaborators listed in spec §3's ownership summary and drives
/// the per-connection lifecycle named in §4.9.
#[derive(Clone)]
pub struct SessionManager {
    control_registry: Arc<ControlRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    authenticator: Arc<Authenticator>,
    broker: Arc<TunnelBroker>,
    resume_manager: Arc<ResumeManager>,
    limits: ResourceLimits,
    timeouts: Timeouts,
    stats: Arc<SessionStats>,
    shutdown: Arc<Notify>,
    draining: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        control_registry: Arc<ControlRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        authenticator: Arc<Authenticator>,
        broker: Arc<TunnelBroker>,
        resume_manager: Arc<ResumeManager>,
        limits: ResourceLimits,
        timeouts: Timeouts,
    ) -> Self {
        SessionManager {
            control_registry,
            dispatcher,
            authenticator,
            broker,
            resume_manager,
            limits,
            timeouts,
            stats: Arc::new(SessionStats::default()),
            shutdown: Arc::new(Notify::new()),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            connections_accepted: self.stats.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.stats.connections_active.load(Ordering::Relaxed),
            tunnels_opened: self.stats.tunnels_opened.load(Ordering::Relaxed),
            handshake_failures: self.stats.handshake_failures.load(Ordering::Relaxed),
            commands_dispatched: self.stats.commands_dispatched.load(Ordering::Relaxed),
        }
    }

    pub fn resume_manager(&self) -> Arc<ResumeManager> {
        self.resume_manager.clone()
    }

    /// Starts the background stale-connection sweep (spec §4.9: default
    /// 60s heartbeat timeout, swept every 15s). Stops when `begin_shutdown`
    /// is called.
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.control_registry.clone();
        let timeouts = self.timeouts;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeouts.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = tunnox_common::time::timestamp_secs();
                        let removed = registry.cleanup_stale(timeouts.heartbeat_timeout.as_secs() as i64, now);
                        if removed > 0 {
                            debug!(removed, "swept stale control connections");
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        })
    }

    /// Begins graceful shutdown (`SPEC_FULL.md` §C): stops admitting new
    /// connections and wakes background tasks waiting on `shutdown`.
    /// Existing streaming tunnels are left to finish on their own — the
    /// spec gives no deadline for forcing them closed.
    pub fn begin_shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Accepts one transport-level stream. Registers a `ControlConnection`,
    /// runs its packet loop to completion, and cleans up on return. The
    /// transport adapter is expected to `tokio::spawn` this per accepted
    /// socket (spec §4.9: "AcceptConnection ... returns a handle; the caller
    /// then drives the connection's packet loop").
    pub async fn serve_connection<R, W>(&self, remote_addr: String, protocol: String, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_draining() {
            debug!(remote_addr = %remote_addr, "rejecting connection: session manager is draining");
            return;
        }
        if self.control_registry.len() >= self.limits.max_base_connections {
            warn!(remote_addr = %remote_addr, "rejecting connection: base connection limit reached");
            return;
        }

        let conn_id = tunnox_common::ids::new_prefixed_id("conn");
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);
        tokio::spawn(run_writer_task(writer, writer_rx));

        let sink: Arc<dyn ConnectionSink> = Arc::new(ChannelSink {
            tx: writer_tx.clone(),
            remote_addr: remote_addr.clone(),
        });
        let conn = Arc::new(ControlConnection::new(conn_id.clone(), remote_addr, protocol, sink));

        if let Err(err) = self.control_registry.register(conn.clone()) {
            warn!(conn_id = %conn_id, error = %err, "rejecting connection");
            let _ = writer_tx.send(WriterCommand::Close).await;
            return;
        }
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        info!(conn_id = %conn_id, "control connection accepted");

        self.run_packet_loop(conn.clone(), reader, writer_tx).await;

        self.control_registry.remove(&conn.conn_id);
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        info!(conn_id = %conn.conn_id, "control connection closed");
    }

    async fn run_packet_loop<R>(&self, conn: Arc<ControlConnection>, mut reader: R, writer_tx: mpsc::Sender<WriterCommand>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            let packet = match codec::read_packet(&mut reader).await {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(conn_id = %conn.conn_id, error = %err, "packet loop ending: read error");
                    break;
                }
            };
            conn.touch();

            match self.handle_packet(&conn, packet).await {
                Ok(PacketOutcome::Continue) => continue,
                Ok(PacketOutcome::EnterStreaming(tunnel_id)) => {
                    self.stats.tunnels_opened.fetch_add(1, Ordering::Relaxed);
                    info!(conn_id = %conn.conn_id, tunnel_id = %tunnel_id, "connection entering streaming mode");

                    let (reply_tx, reply_rx) = oneshot::channel();
                    if writer_tx.send(WriterCommand::Detach(reply_tx)).await.is_err() {
                        break;
                    }
                    let Ok(writer) = reply_rx.await else { break };

                    let duplex = tokio::io::join(reader, writer);
                    self.broker.attach_local_duplex(&tunnel_id, &conn.conn_id, Box::new(duplex));
                    return;
                }
                Err(err) => {
                    warn!(conn_id = %conn.conn_id, error = %err, "packet handling failed; connection stays open");
                }
            }
        }
    }

    async fn handle_packet(&self, conn: &Arc<ControlConnection>, packet: TransferPacket) -> Result<PacketOutcome, CoreError> {
        let Some(cmd) = packet.as_command() else {
            // Keepalive/control frames before streaming mode carry no
            // dispatchable work; `conn.touch()` above already recorded
            // the liveness signal.
            return Ok(PacketOutcome::Continue);
        };
        let cmd = cmd.clone();

        if cmd.is_request() && CommandType::from_u16(cmd.command_type) == Some(CommandType::Handshake) {
            return self.handle_handshake(conn, cmd).await;
        }

        if conn.state() != ControlState::Authenticated {
            return self.reject_unauthenticated(conn, cmd).await;
        }

        self.stats.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        match self.dispatcher.execute(&conn.conn_id, TransferPacket::command(cmd)).await? {
            ExecuteOutcome::Reply(Some(reply)) => {
                conn.sink.send(reply).await?;
                Ok(PacketOutcome::Continue)
            }
            ExecuteOutcome::Reply(None) => Ok(PacketOutcome::Continue),
            ExecuteOutcome::EnterStreaming(tunnel_id) => Ok(PacketOutcome::EnterStreaming(tunnel_id)),
        }
    }

    async fn handle_handshake(&self, conn: &Arc<ControlConnection>, cmd: CommandPacket) -> Result<PacketOutcome, CoreError> {
        let req = serde_json::from_str(&cmd.body).map_err(|e| CoreError::invalid_param(e.to_string()))?;
        let remote_ip = parse_remote_ip(&conn.remote_addr);

        let response = self.authenticator.handle(conn, &self.control_registry, remote_ip, req).await;
        if !response.success && response.need_response != Some(true) {
            self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
        }

        let body = serde_json::to_string(&response).unwrap_or_default();
        conn.sink
            .send(TransferPacket::command(CommandPacket::response(
                CommandType::Handshake as u16,
                cmd.request_id,
                body,
            )))
            .await?;
        Ok(PacketOutcome::Continue)
    }

    async fn reject_unauthenticated(&self, conn: &Arc<ControlConnection>, cmd: CommandPacket) -> Result<PacketOutcome, CoreError> {
        if cmd.is_request() {
            let body = serde_json::to_string(&GenericResponse::err("Unauthorized: complete the handshake first")).unwrap_or_default();
            conn.sink
                .send(TransferPacket::command(CommandPacket::response(cmd.command_type, cmd.request_id, body)))
                .await?;
        }
        Ok(PacketOutcome::Continue)
    }
}
