//! The Tunnox session layer (spec §2 "THE CORE"): framing, buffers,
//! the control-connection registry, the challenge-response authenticator,
//! the command dispatcher, the tunnel broker and its cross-node bridge, the
//! session manager, and the resume/migration manager. Everything outside
//! this crate — transports, storage, the message bus, configuration
//! loading, CLI/HTTP management — is an injected collaborator (spec §1, §6).

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod buffers;
pub mod codec;
pub mod codes;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod resume;
pub mod session;
pub mod state;
pub mod tunnels;

pub mod bridge_proto {
    tonic::include_proto!("tunnox.bridge");
}

pub(crate) use tunnox_common::time::timestamp_secs as time_now;
