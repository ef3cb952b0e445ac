//! Resource limits, timeouts, and auth policy knobs (spec §5 "Resource
//! limits", §4.5, §4.10). All defaults mirror the numbers named in the spec
//! text; nothing here is load-bearing for correctness, only for the caps a
//! production deployment needs.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_base_connections: usize,
    pub max_control_connections: usize,
    pub send_buffer_max_bytes: usize,
    pub send_buffer_max_packets: usize,
    pub receive_reorder_max: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_base_connections: 10_000,
            max_control_connections: 5_000,
            send_buffer_max_bytes: 10 * 1024 * 1024,
            send_buffer_max_packets: 1_000,
            receive_reorder_max: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub heartbeat_timeout: Duration,
    pub cleanup_interval: Duration,
    pub resend_timeout: Duration,
    pub request_timeout: Duration,
    pub tunnel_ready_timeout: Duration,
    pub resume_token_ttl: Duration,
    pub tunnel_state_ttl: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            heartbeat_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            resend_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            tunnel_ready_timeout: Duration::from_secs(5),
            resume_token_ttl: Duration::from_secs(30),
            tunnel_state_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Decided Open Questions from `SPEC_FULL.md` §D.
#[derive(Debug, Clone, Copy)]
pub struct AuthConfig {
    /// Off by default (spec §9 Open Question: the auto-bootstrap behaviour
    /// is "convenient for development but surprising in production").
    pub allow_implicit_bootstrap: bool,
    pub brute_force_max_failures: u32,
    pub brute_force_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            allow_implicit_bootstrap: false,
            brute_force_max_failures: 5,
            brute_force_window: Duration::from_secs(15 * 60),
        }
    }
}
