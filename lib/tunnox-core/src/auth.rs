//! Challenge–response authenticator (C5, spec §4.5). Two-phase HMAC
//! handshake with anonymous credential bootstrap, plus the pre-flight
//! policy chain (`SPEC_FULL.md` §C) and the canonical decision table
//! (`SPEC_FULL.md` §D.1) that replaces the legacy/challenge-response
//! overlap the spec calls out as an open question.

use std::net::IpAddr;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{info, warn};
use tunnox_common::crypto::{random_bytes, verify_hmac_sha256};
use tunnox_types::{CoreError, HandshakeRequest, HandshakeResponse};

use crate::config::AuthConfig;
use crate::connection::ControlConnection;
use crate::contracts::{AnonymousRateLimiter, BruteForceGuard, CloudControl, IpPolicy};
use crate::registry::ControlRegistry;

const CHALLENGE_SIZE: usize = 32;

/// The decided, total decision table of `SPEC_FULL.md` §D.1. Every
/// `HandshakeRequest` maps to exactly one arm.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum HandshakePhase {
    AnonymousBootstrap,
    PhaseOneChallenge,
    PhaseTwoVerify,
    LegacyPlaintext,
}

fn decide(req: &HandshakeRequest, client_has_legacy_secret: bool, allow_implicit_bootstrap: bool) -> Result<HandshakePhase, CoreError> {
    if req.client_id == 0 {
        let explicit = req.token == "new-client" || req.token.starts_with("anonymous:");
        return if explicit || (allow_implicit_bootstrap && !req.token.is_empty()) {
            Ok(HandshakePhase::AnonymousBootstrap)
        } else {
            Err(CoreError::invalid_param("unrecognized anonymous bootstrap token"))
        };
    }

    match &req.challenge_response {
        Some(_) => Ok(HandshakePhase::PhaseTwoVerify),
        None if client_has_legacy_secret => Ok(HandshakePhase::LegacyPlaintext),
        None => Ok(HandshakePhase::PhaseOneChallenge),
    }
}

pub struct Authenticator {
    cloud_control: Arc<dyn CloudControl>,
    ip_policy: Arc<dyn IpPolicy>,
    brute_force: Arc<dyn BruteForceGuard>,
    anon_rate_limit: Arc<dyn AnonymousRateLimiter>,
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(
        cloud_control: Arc<dyn CloudControl>,
        ip_policy: Arc<dyn IpPolicy>,
        brute_force: Arc<dyn BruteForceGuard>,
        anon_rate_limit: Arc<dyn AnonymousRateLimiter>,
        config: AuthConfig,
    ) -> Self {
        Authenticator {
            cloud_control,
            ip_policy,
            brute_force,
            anon_rate_limit,
            config,
        }
    }

    /// Runs the full handshake for one `HandshakeRequest` against one
    /// `ControlConnection`. Pre-flight checks run in the order spec §4.5
    /// names: IP allow/blacklist → brute-force ban → anonymous rate limit.
    pub async fn handle(
        &self,
        conn: &Arc<ControlConnection>,
        registry: &ControlRegistry,
        remote_ip: IpAddr,
        req: HandshakeRequest,
    ) -> HandshakeResponse {
        if !self.ip_policy.is_allowed(remote_ip).await {
            warn!(%remote_ip, "handshake rejected: IP not allowed");
            self.brute_force.record_failure(remote_ip).await;
            return HandshakeResponse::failed("Access denied: IP not allowed");
        }

        if self.brute_force.is_blocked(remote_ip).await {
            warn!(%remote_ip, "handshake rejected: too many failed attempts");
            self.brute_force.record_failure(remote_ip).await;
            return HandshakeResponse::failed("Access denied: too many failed attempts");
        }

        if req.client_id == 0 && !self.anon_rate_limit.allow(remote_ip).await {
            warn!(%remote_ip, "handshake rejected: anonymous bootstrap rate limited");
            self.brute_force.record_failure(remote_ip).await;
            return HandshakeResponse::failed("Access denied: rate limited");
        }

        match self.dispatch(conn, registry, remote_ip, req).await {
            Ok(resp) => resp,
            Err(err) => {
                self.brute_force.record_failure(remote_ip).await;
                HandshakeResponse::failed(err.message)
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<ControlConnection>,
        registry: &ControlRegistry,
        remote_ip: IpAddr,
        req: HandshakeRequest,
    ) -> Result<HandshakeResponse, CoreError> {
        let client_config = if req.client_id > 0 {
            self.cloud_control.get_client_config(req.client_id).await?
        } else {
            None
        };
        let legacy_secret = client_config.as_ref().is_some_and(|c| c.legacy_plaintext_mode);

        match decide(&req, legacy_secret, self.config.allow_implicit_bootstrap)? {
            HandshakePhase::AnonymousBootstrap => self.bootstrap().await,

            HandshakePhase::LegacyPlaintext => {
                warn!(client_id = req.client_id, "client authenticated via legacy plaintext-secret mode; migrate to challenge-response");
                let config = client_config.ok_or_else(|| CoreError::client_not_found("client not found"))?;
                if config.expires_at.is_some_and(|exp| exp <= tunnox_common::time::timestamp_secs()) {
                    return Err(CoreError::credentials_expired("client credentials expired"));
                }
                let presented = req.token.as_bytes();
                if !bool::from(presented.ct_eq(config.secret_key.as_slice())) {
                    return Err(CoreError::unauthorized("invalid legacy secret"));
                }
                self.authenticate_connection(conn, registry, req.client_id, remote_ip).await?;
                self.brute_force.record_success(remote_ip).await;
                Ok(HandshakeResponse::authenticated())
            }

            HandshakePhase::PhaseOneChallenge => {
                let config = client_config.ok_or_else(|| CoreError::client_not_found("client not found"))?;
                if config.expires_at.is_some_and(|exp| exp <= tunnox_common::time::timestamp_secs()) {
                    return Err(CoreError::credentials_expired("client credentials expired"));
                }
                let mut challenge = [0u8; CHALLENGE_SIZE];
                random_bytes(&mut challenge);
                conn.begin_authenticating(challenge);
                Ok(HandshakeResponse::need_response(tunnox_common::encoding::encode(&challenge)))
            }

            HandshakePhase::PhaseTwoVerify => {
                // Cleared before verifying so a replayed second attempt with
                // the same (or a different) response can never succeed
                // (spec §4.5).
                let challenge = conn
                    .take_pending_challenge()
                    .ok_or_else(|| CoreError::unauthorized("no pending challenge for this connection"))?;

                let config = client_config.ok_or_else(|| CoreError::client_not_found("client not found"))?;
                let response_bytes = tunnox_common::encoding::decode(req.challenge_response.as_deref().unwrap_or(""))
                    .map_err(|_| CoreError::invalid_param("challengeResponse is not valid base64"))?;

                if !verify_hmac_sha256(&config.secret_key, &challenge, &response_bytes) {
                    return Err(CoreError::unauthorized("challenge response did not verify"));
                }

                self.authenticate_connection(conn, registry, req.client_id, remote_ip).await?;
                self.brute_force.record_success(remote_ip).await;
                Ok(HandshakeResponse::authenticated())
            }
        }
    }

    async fn bootstrap(&self) -> Result<HandshakeResponse, CoreError> {
        let bootstrap = self.cloud_control.generate_anonymous_credentials().await?;
        info!(client_id = bootstrap.client_id, "issued anonymous client credentials");
        Ok(HandshakeResponse::bootstrapped(
            bootstrap.client_id,
            tunnox_common::encoding::encode(&bootstrap.secret_key_plaintext),
        ))
    }

    async fn authenticate_connection(
        &self,
        conn: &Arc<ControlConnection>,
        registry: &ControlRegistry,
        client_id: i64,
        remote_ip: IpAddr,
    ) -> Result<(), CoreError> {
        registry.update_auth(conn, client_id, None);

        if let Err(err) = self
            .cloud_control
            .connect_client(client_id, "local", &conn.conn_id, &remote_ip.to_string(), &conn.protocol, "1.0")
            .await
        {
            warn!(client_id, error = %err, "failed to update cloud-control runtime state after authentication");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_is_total_over_the_handshake_shape() {
        let anon = HandshakeRequest {
            client_id: 0,
            token: "new-client".into(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        };
        assert_eq!(decide(&anon, false, false).unwrap(), HandshakePhase::AnonymousBootstrap);

        let phase_one = HandshakeRequest {
            client_id: 10_000_001,
            token: String::new(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        };
        assert_eq!(decide(&phase_one, false, false).unwrap(), HandshakePhase::PhaseOneChallenge);

        let legacy = HandshakeRequest {
            client_id: 10_000_001,
            token: "plain-secret".into(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        };
        assert_eq!(decide(&legacy, true, false).unwrap(), HandshakePhase::LegacyPlaintext);

        let phase_two = HandshakeRequest {
            client_id: 10_000_001,
            token: String::new(),
            challenge_response: Some("deadbeef".into()),
            protocol: "tcp".into(),
            version: "1.0".into(),
        };
        assert_eq!(decide(&phase_two, false, false).unwrap(), HandshakePhase::PhaseTwoVerify);
    }

    #[test]
    fn unrecognized_anonymous_token_is_rejected_unless_implicit_bootstrap_is_on() {
        let req = HandshakeRequest {
            client_id: 0,
            token: "looks-like-a-secret".into(),
            challenge_response: None,
            protocol: "tcp".into(),
            version: "1.0".into(),
        };
        assert!(decide(&req, false, false).is_err());
        assert_eq!(decide(&req, false, true).unwrap(), HandshakePhase::AnonymousBootstrap);
    }
}
