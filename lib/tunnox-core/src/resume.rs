//! Resume / migration manager (C10, spec §4.10). Captures a streaming
//! tunnel's live buffers into the TTL-bound store (C3) and issues the short
//! opaque resume token a reconnecting client presents to `TUNNEL_OPEN`
//! instead of a mapping ID — validating that token and loading the state
//! back is `CloudControl::validate_tunnel_resume_token`'s job (§6), since
//! the cloud-control plane is what a resuming client actually talks to
//! first.
//!
//! Grounded on `state.rs`'s signing pattern — same insecure compile-time
//! fallback, logged once — generalized from "one signed blob" to "one
//! signed, TTL-bound claim set" via `tunnox_types::ResumeTokenClaims`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use tunnox_common::crypto::hmac_sha256;
use tunnox_common::encoding;
use tunnox_common::time::timestamp_secs;
use tunnox_types::{CoreError, ResumeTokenClaims, TunnelState};

use crate::config::Timeouts;
use crate::connection::{TunnelConnection, TunnelLifecycle};
use crate::state::TunnelStateStore;
use crate::tunnels::TunnelRegistry;

const INSECURE_DEV_RESUME_SECRET: &[u8] = b"tunnox-dev-insecure-default-resume-secret";

pub struct ResumeManager {
    state_store: Arc<TunnelStateStore>,
    secret: Vec<u8>,
    timeouts: Timeouts,
}

impl ResumeManager {
    /// `secret = None` is only acceptable for single-node development, same
    /// caveat as `TunnelStateStore::new` — a cluster deployment must pass an
    /// explicit secret shared with whatever validates the tokens it issues.
    pub fn new(state_store: Arc<TunnelStateStore>, secret: Option<Vec<u8>>, timeouts: Timeouts) -> Self {
        let secret = secret.unwrap_or_else(|| {
            warn!("resume-token signing secret not configured; falling back to an insecure development default");
            INSECURE_DEV_RESUME_SECRET.to_vec()
        });
        ResumeManager {
            state_store,
            secret,
            timeouts,
        }
    }

    /// Snapshots `conn`'s send/receive buffers into a `TunnelState` and
    /// saves it (spec §4.10: "captured on every acknowledged chunk, or at
    /// least every N seconds, whichever is less frequent" — the caller picks
    /// the cadence, this does one capture).
    pub async fn capture(&self, conn: &Arc<TunnelConnection>) -> Result<(), CoreError> {
        let buffered_packets = conn.with_send_buffer(|buf| buf.snapshot()).unwrap_or_default();
        let next_seq = conn.with_send_buffer(|buf| buf.next_seq()).unwrap_or(1);
        let last_seq_num = next_seq.saturating_sub(1);
        // The ack watermark isn't tracked separately from the buffer: every
        // seq below the lowest still-unconfirmed packet has been acked.
        let last_ack_num = buffered_packets.iter().map(|p| p.seq_num).min().map_or(last_seq_num, |m| m.saturating_sub(1));
        let next_expected_seq = conn.with_receive_buffer(|buf| buf.next_expected()).unwrap_or(1);

        let now = timestamp_secs();
        let state = TunnelState {
            tunnel_id: conn.tunnel_id.clone(),
            mapping_id: conn.mapping_id.clone(),
            listen_client_id: conn.owner_client_id,
            target_client_id: conn.peer_client_id,
            last_seq_num,
            last_ack_num,
            next_expected_seq,
            buffered_packets,
            created_at: now,
            updated_at: now,
            signature: String::new(),
        };

        self.state_store.save(state).await
    }

    /// Captures current state and mints the resume token for it in one step
    /// — used when a streaming tunnel's duplex breaks unexpectedly and the
    /// session manager wants to give the client something to reconnect with
    /// (spec §4.10 "suspend").
    pub async fn suspend(&self, conn: &Arc<TunnelConnection>) -> Result<String, CoreError> {
        conn.set_state(TunnelLifecycle::Suspended);
        self.capture(conn).await?;
        Ok(self.issue_resume_token(&conn.tunnel_id))
    }

    /// Mints an opaque, signed, TTL-bound resume token for `tunnel_id`
    /// (spec §3 `RESUME_TOKEN_DEFAULT_TTL_SECS` = 30s, overridable via
    /// `Timeouts::resume_token_ttl`). The token carries no buffer data
    /// itself — just enough to let the validator find and verify the real
    /// `TunnelState` in the shared store.
    pub fn issue_resume_token(&self, tunnel_id: &str) -> String {
        let issued_at = timestamp_secs();
        let claims = ResumeTokenClaims {
            tunnel_id: tunnel_id.to_string(),
            issued_at,
            expires_at: issued_at + self.timeouts.resume_token_ttl.as_secs() as i64,
        };
        encode_token(&claims, &self.secret)
    }

    /// Drops a tunnel's persisted state outright — used once a resume token
    /// has been successfully redeemed, so it can't be replayed (spec §4.10:
    /// a resume token is single-use).
    pub async fn discard(&self, tunnel_id: &str) -> Result<(), CoreError> {
        self.state_store.delete(tunnel_id).await
    }

    /// Starts the periodic capture sweep over every currently registered
    /// tunnel side, for tunnels that never go through `suspend` (still
    /// healthy, streaming) but whose state should stay fresh in the store in
    /// case the process dies uncleanly (spec §4.10, §5 background tasks).
    pub fn spawn_periodic_capture(&self, tunnel_registry: Arc<TunnelRegistry>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        Self: Sized,
    {
        let state_store = self.state_store.clone();
        let secret = self.secret.clone();
        let timeouts = self.timeouts;
        tokio::spawn(async move {
            let manager = ResumeManager {
                state_store,
                secret,
                timeouts,
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sides = tunnel_registry.all_sides();
                let mut captured = 0usize;
                for side in sides.iter().filter(|c| c.state() == TunnelLifecycle::Streaming) {
                    if let Err(err) = manager.capture(side).await {
                        warn!(tunnel_id = %side.tunnel_id, error = %err, "periodic tunnel state capture failed");
                    } else {
                        captured += 1;
                    }
                }
                if captured > 0 {
                    debug!(captured, "periodic tunnel state capture swept");
                }
            }
        })
    }
}

fn encode_token(claims: &ResumeTokenClaims, secret: &[u8]) -> String {
    let body = serde_json::to_vec(claims).expect("ResumeTokenClaims always serializes");
    let tag = hmac_sha256(secret, &body);
    format!("{}.{}", encoding::encode(&body), encoding::encode(&tag))
}

/// Decodes and verifies a token minted by `issue_resume_token`, independent
/// of any `Kv`-backed state lookup. `CloudControl` implementations needing
/// the exact same verification this crate issues against can reuse this
/// rather than reimplementing the `"body.tag"` framing.
pub fn decode_token(token: &str, secret: &[u8]) -> Result<ResumeTokenClaims, CoreError> {
    let (body_b64, tag_b64) = token
        .split_once('.')
        .ok_or_else(|| CoreError::unauthorized("malformed resume token"))?;

    let body = encoding::decode(body_b64).map_err(|_| CoreError::unauthorized("malformed resume token"))?;
    let tag = encoding::decode(tag_b64).map_err(|_| CoreError::unauthorized("malformed resume token"))?;

    if !tunnox_common::crypto::verify_hmac_sha256(secret, &body, &tag) {
        return Err(CoreError::unauthorized("resume token signature did not verify"));
    }

    let claims: ResumeTokenClaims = serde_json::from_slice(&body).map_err(|e| CoreError::invalid_param(e.to_string()))?;
    if claims.expires_at <= timestamp_secs() {
        return Err(CoreError::state_expired("resume token has expired"));
    }
    Ok(claims)
}
