//! `ControlConnection` and `TunnelConnection` (spec §3, §4.9, §4.10) — the
//! runtime connection objects the registry (C4) and broker (C7) operate on.
//! Transport adapters (TCP/QUIC/WebSocket/HTTP long-poll) are out of scope
//! (§1), so both structs are generic over a small injected sink/duplex
//! surface rather than owning a concrete socket.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tunnox_types::{CoreError, TransferPacket};

use crate::buffers::{ReceiveBuffer, SendBuffer};
use crate::time_now;

/// What a connection needs from its transport while it is exchanging framed
/// `TransferPacket`s (handshake, commands, sequenced data before a tunnel
/// enters streaming mode).
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, packet: TransferPacket) -> Result<(), CoreError>;
    async fn close(&self);
    fn remote_addr(&self) -> String;
}

/// A byte-level duplex a `TunnelConnection` hands to the splice task once it
/// enters streaming mode (§4.7 "switch both tunnel connections to streaming
/// mode and splice"). Any type implementing `AsyncRead + AsyncWrite` already
/// satisfies this — transports, and the gRPC bridge duplex (C8) alike.
pub trait TunnelDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelDuplex for T {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlState {
    Accepted,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

pub struct ControlConnection {
    pub conn_id: String,
    pub remote_addr: String,
    pub protocol: String,
    pub sink: Arc<dyn ConnectionSink>,
    client_id: Mutex<Option<i64>>,
    user_id: Mutex<Option<i64>>,
    pending_challenge: Mutex<Option<[u8; 32]>>,
    state: Mutex<ControlState>,
    last_active_unix: AtomicI64,
}

impl ControlConnection {
    pub fn new(conn_id: String, remote_addr: String, protocol: String, sink: Arc<dyn ConnectionSink>) -> Self {
        ControlConnection {
            conn_id,
            remote_addr,
            protocol,
            sink,
            client_id: Mutex::new(None),
            user_id: Mutex::new(None),
            pending_challenge: Mutex::new(None),
            state: Mutex::new(ControlState::Accepted),
            last_active_unix: AtomicI64::new(time_now()),
        }
    }

    pub fn client_id(&self) -> Option<i64> {
        *self.client_id.lock()
    }

    pub fn user_id(&self) -> Option<i64> {
        *self.user_id.lock()
    }

    pub fn state(&self) -> ControlState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ControlState) {
        *self.state.lock() = state;
    }

    pub fn begin_authenticating(&self, challenge: [u8; 32]) {
        *self.pending_challenge.lock() = Some(challenge);
        self.set_state(ControlState::Authenticating);
    }

    /// Consumes the pending challenge so it can only ever be checked once
    /// (spec §4.5: a phase-two reply is single-use, preventing replay).
    pub fn take_pending_challenge(&self) -> Option<[u8; 32]> {
        self.pending_challenge.lock().take()
    }

    pub fn mark_authenticated(&self, client_id: i64, user_id: Option<i64>) {
        *self.client_id.lock() = Some(client_id);
        *self.user_id.lock() = user_id;
        self.set_state(ControlState::Authenticated);
    }

    pub fn touch(&self) {
        self.last_active_unix.store(time_now(), Ordering::Relaxed);
    }

    pub fn last_active_unix(&self) -> i64 {
        self.last_active_unix.load(Ordering::Relaxed)
    }

    pub fn is_idle_since(&self, now_unix: i64, timeout_secs: i64) -> bool {
        now_unix - self.last_active_unix() > timeout_secs
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TunnelLifecycle {
    Opening,
    Authorized,
    Paired,
    Streaming,
    Suspended,
    Closing,
    Closed,
}

/// How this side participates in the splice once both sides of a tunnel are
/// authorized (spec §4.7). Decided once by `broker::TunnelBroker` at
/// authorization time and read back when the duplex is attached:
///
/// - Two same-node sides live in one process, so only one of them may call
///   `copy_bidirectional` against both duplexes — the one whose
///   registration completed the pair (`TunnelRegistry::register` returning
///   `true`) is the `SameNodeDriver`; the other is a `SameNodeCooperator`
///   that only needs to keep its duplex alive for the driver to take.
/// - Cross-node sides never share a process: each side always drives its
///   own local-duplex ↔ bridge-duplex copy independently. The node where the
///   client first calls `TUNNEL_OPEN` with no local peer is the
///   `CrossNodeInitiator` — it publishes `tunnox.tunnel_open` and dials out
///   once it learns the responder's node from `tunnox.tunnel_ready`. The node
///   that owns the *other* client reacts to that broadcast; it is the
///   `CrossNodeResponder` — it publishes `tunnox.tunnel_ready` itself and
///   waits for the initiator's node to dial its `TunnelBridge` gRPC service
///   (spec §4.7/§4.8).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SpliceRole {
    SameNodeDriver,
    SameNodeCooperator,
    CrossNodeInitiator,
    CrossNodeResponder,
}

pub struct TunnelConnection {
    pub tunnel_id: String,
    pub conn_id: String,
    pub mapping_id: Option<String>,
    pub owner_client_id: i64,
    pub peer_client_id: i64,
    pub sequence_numbers_enabled: bool,
    sink: Mutex<Option<Arc<dyn ConnectionSink>>>,
    duplex: Mutex<Option<Box<dyn TunnelDuplex>>>,
    send_buffer: Mutex<Option<SendBuffer>>,
    receive_buffer: Mutex<Option<ReceiveBuffer>>,
    state: Mutex<TunnelLifecycle>,
    splice_role: Mutex<Option<SpliceRole>>,
    last_active_unix: AtomicI64,
}

impl TunnelConnection {
    pub fn new(
        tunnel_id: String,
        conn_id: String,
        mapping_id: Option<String>,
        owner_client_id: i64,
        peer_client_id: i64,
        sequence_numbers_enabled: bool,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        let (send_buffer, receive_buffer) = if sequence_numbers_enabled {
            (Some(SendBuffer::new()), Some(ReceiveBuffer::new()))
        } else {
            (None, None)
        };

        TunnelConnection {
            tunnel_id,
            conn_id,
            mapping_id,
            owner_client_id,
            peer_client_id,
            sequence_numbers_enabled,
            sink: Mutex::new(Some(sink)),
            duplex: Mutex::new(None),
            send_buffer: Mutex::new(send_buffer),
            receive_buffer: Mutex::new(receive_buffer),
            state: Mutex::new(TunnelLifecycle::Opening),
            splice_role: Mutex::new(None),
            last_active_unix: AtomicI64::new(time_now()),
        }
    }

    pub fn state(&self) -> TunnelLifecycle {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TunnelLifecycle) {
        *self.state.lock() = state;
    }

    pub fn splice_role(&self) -> Option<SpliceRole> {
        *self.splice_role.lock()
    }

    pub fn set_splice_role(&self, role: SpliceRole) {
        *self.splice_role.lock() = Some(role);
    }

    pub fn sink(&self) -> Option<Arc<dyn ConnectionSink>> {
        self.sink.lock().clone()
    }

    pub fn install_duplex(&self, duplex: Box<dyn TunnelDuplex>) {
        *self.duplex.lock() = Some(duplex);
    }

    /// Takes ownership of the byte duplex for splicing. Single use: the
    /// splice task consumes it, it is never returned to the tunnel.
    pub fn take_duplex(&self) -> Option<Box<dyn TunnelDuplex>> {
        self.duplex.lock().take()
    }

    pub fn with_send_buffer<R>(&self, f: impl FnOnce(&mut SendBuffer) -> R) -> Option<R> {
        self.send_buffer.lock().as_mut().map(f)
    }

    pub fn with_receive_buffer<R>(&self, f: impl FnOnce(&mut ReceiveBuffer) -> R) -> Option<R> {
        self.receive_buffer.lock().as_mut().map(f)
    }

    pub fn touch(&self) {
        self.last_active_unix.store(time_now(), Ordering::Relaxed);
    }

    pub fn last_active_unix(&self) -> i64 {
        self.last_active_unix.load(Ordering::Relaxed)
    }
}
