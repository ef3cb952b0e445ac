//! Command dispatcher (C6, spec §4.6). Maps command codes to handlers,
//! routes requests and responses by `requestId`/`commandId`, and owns the
//! pending-request table `SendRequest` waits on. Grounded on the teacher's
//! `system` scheduler pattern (one registry of named units, each invoked by
//! a dynamic key) adapted from a fixed tick loop to per-packet dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, warn};
use tunnox_types::{CommandPacket, CoreError, TransferPacket};

/// Where a command may legally originate, for documentation and future
/// policy enforcement — not load-bearing for dispatch itself (spec §4.6).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Duplex,
}

#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub command_type: u16,
    pub category: &'static str,
    pub direction: Direction,
    pub name: &'static str,
}

/// What a handler hands back to the dispatcher. `EnterStreaming` is the
/// "switch to byte-splice mode" sentinel of spec §4.7/§4.9 Design Notes —
/// the packet loop's only responsibility on seeing it is to stop reading
/// framed packets.
pub enum HandlerOutcome {
    Reply(String),
    NoReply,
    /// Carries the `tunnelID` the packet loop should hand its raw duplex to
    /// once it stops reading framed packets (`broker::TunnelBroker::attach_local_duplex`).
    EnterStreaming(String),
}

/// What the packet loop (C9) must do after `CommandDispatcher::execute`
/// returns. `EnterStreaming` is the only variant that tells the loop to
/// stop reading framed packets; everything else keeps it running.
pub enum ExecuteOutcome {
    Reply(Option<TransferPacket>),
    EnterStreaming(String),
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn info(&self) -> HandlerInfo;
    async fn handle(&self, conn_id: &str, body: &str) -> Result<HandlerOutcome, CoreError>;
}

/// Per-connection state the dispatcher needs to route a response back to
/// whoever is waiting for it and to know which stream to write replies on.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send(&self, conn_id: &str, packet: TransferPacket) -> Result<(), CoreError>;
}

struct PendingRequest {
    reply: oneshot::Sender<CommandPacket>,
}

pub struct CommandDispatcher {
    handlers: DashMap<u16, Arc<dyn CommandHandler>>,
    pending: DashMap<String, PendingRequest>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        CommandDispatcher {
            handlers: DashMap::new(),
            pending: DashMap::new(),
            default_timeout,
        }
    }

    pub fn register(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.info().command_type, handler);
    }

    pub fn handlers(&self) -> HashMap<u16, HandlerInfo> {
        self.handlers.iter().map(|e| (*e.key(), e.value().info())).collect()
    }

    /// Executes one inbound packet against the registered handlers (spec
    /// §4.6 dispatch rules).
    pub async fn execute(&self, conn_id: &str, packet: TransferPacket) -> Result<ExecuteOutcome, CoreError> {
        let cmd = packet
            .as_command()
            .ok_or_else(|| CoreError::invalid_packet("expected a command packet"))?
            .clone();

        if cmd.is_response() {
            self.deliver_response(cmd);
            return Ok(ExecuteOutcome::Reply(None));
        }

        if !cmd.is_request() {
            return Err(CoreError::invalid_packet("command packet is neither a request nor a response"));
        }

        let Some(handler) = self.handlers.get(&cmd.command_type).map(|e| e.clone()) else {
            warn!(command_type = cmd.command_type, "unsupported command");
            let body = serde_json::to_string(&tunnox_types::GenericResponse::err("UnsupportedCommand")).unwrap();
            return Ok(ExecuteOutcome::Reply(Some(TransferPacket::command(CommandPacket::response(
                cmd.command_type,
                cmd.request_id,
                body,
            )))));
        };

        // A handler panic must not take down the reader task that owns
        // this connection's packet loop (spec §4.6: "Handler panic: caught,
        // logged, converted to error response").
        let future = std::panic::AssertUnwindSafe(handler.handle(conn_id, &cmd.body));
        let outcome = match futures::FutureExt::catch_unwind(future).await {
            Ok(result) => result,
            Err(_) => {
                error!(command_type = cmd.command_type, "command handler panicked");
                Err(CoreError::internal("handler panicked"))
            }
        };

        match outcome {
            Ok(HandlerOutcome::Reply(body)) => Ok(ExecuteOutcome::Reply(Some(TransferPacket::command(CommandPacket::response(
                cmd.command_type,
                cmd.request_id,
                body,
            ))))),
            Ok(HandlerOutcome::NoReply) => Ok(ExecuteOutcome::Reply(None)),
            Ok(HandlerOutcome::EnterStreaming(tunnel_id)) => Ok(ExecuteOutcome::EnterStreaming(tunnel_id)),
            Err(err) => {
                let body = serde_json::to_string(&tunnox_types::GenericResponse::err(err.message)).unwrap();
                Ok(ExecuteOutcome::Reply(Some(TransferPacket::command(CommandPacket::response(
                    cmd.command_type,
                    cmd.request_id,
                    body,
                )))))
            }
        }
    }

    fn deliver_response(&self, cmd: CommandPacket) {
        if let Some((_, pending)) = self.pending.remove(&cmd.command_id) {
            let _ = pending.reply.send(cmd);
        }
    }

    /// Sends a request on `sink` and waits (bounded) for the matching
    /// response, resolved by `commandId == requestId` (spec §4.6).
    pub async fn send_request(
        &self,
        sink: &dyn PacketSink,
        conn_id: &str,
        command_type: u16,
        body: String,
        request_timeout: Option<Duration>,
    ) -> Result<CommandPacket, CoreError> {
        let request_id = tunnox_common::ids::new_prefixed_id("req");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), PendingRequest { reply: tx });

        let packet = TransferPacket::command(CommandPacket::request(command_type, request_id.clone(), body));
        if let Err(err) = sink.send(conn_id, packet).await {
            self.pending.remove(&request_id);
            return Err(err);
        }

        let wait = timeout(request_timeout.unwrap_or(self.default_timeout), rx).await;
        self.pending.remove(&request_id);

        match wait {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoreError::internal("response channel dropped")),
            Err(_) => Err(CoreError::timeout(format!("no response to request {request_id} in time"))),
        }
    }
}
