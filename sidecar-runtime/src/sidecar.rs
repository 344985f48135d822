//! Sidecar orchestration: start both duties, poll until shutdown, drain.
//!
//! Startup order is fixed: the signing secret is loaded, then the credential
//! service starts listening, then the extension registers with the host.
//! The function may call `/token` as soon as its first invocation starts, so
//! the service has to be up before registration completes the init phase.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};
use crate::extension::{ExtensionClient, ExtensionIdentity, LifecycleEvent};
use crate::server::{DrainOutcome, TokenServer};
use crate::signing::CredentialIssuer;
use crate::token_api::token_router;

/// Error type reported to the host when the listener dies under us.
const LISTENER_STOPPED_ERROR: &str = "Extension.ListenerStopped";

/// Summary of a clean shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: String,
    pub invocations: u64,
    pub grace: Duration,
    pub drain: DrainOutcome,
}

pub struct Sidecar {
    config: SidecarConfig,
}

impl Sidecar {
    pub fn new(config: SidecarConfig) -> Self {
        Self { config }
    }

    /// Load the secret, start the credential service, register with the host.
    ///
    /// Any failure is fatal. If registration fails the listener is torn down
    /// before the error is returned.
    pub async fn start(self) -> Result<RunningSidecar> {
        let config = self.config;

        let issuer = CredentialIssuer::from_config(&config.signing);
        let client = ExtensionClient::from_config(&config)?;
        let server = TokenServer::start(config.port, token_router(issuer)).await?;

        let identity = match client.register(&config.events).await {
            Ok(identity) => identity,
            Err(err) => {
                error!("Extension registration failed: {err}");
                server.shutdown(Duration::ZERO).await;
                return Err(err);
            }
        };

        Ok(RunningSidecar {
            config,
            client,
            identity,
            server,
        })
    }
}

/// A registered sidecar whose credential service is accepting requests.
pub struct RunningSidecar {
    config: SidecarConfig,
    client: ExtensionClient,
    identity: ExtensionIdentity,
    server: TokenServer,
}

impl RunningSidecar {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn identity(&self) -> &ExtensionIdentity {
        &self.identity
    }

    /// Poll the host until a `SHUTDOWN` event, then drain the credential
    /// service within the grace period.
    ///
    /// Poll failures are logged and retried after the retry delay. If the
    /// credential service stops on its own, including during that delay, the
    /// host is told via `exit/error` and `Listener` is returned.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        let mut invocations: u64 = 0;

        let (reason, deadline_ms) = loop {
            tokio::select! {
                event = self.client.next_event(&self.identity) => match event {
                    Ok(LifecycleEvent::Invoke { request_id, .. }) => {
                        invocations += 1;
                        debug!(%request_id, invocations, "Invoke event");
                    }
                    Ok(LifecycleEvent::Shutdown { reason, deadline_ms }) => {
                        info!(%reason, deadline_ms, "Shutdown event received");
                        break (reason, deadline_ms);
                    }
                    Ok(LifecycleEvent::Error { event_type, .. }) => {
                        warn!(%event_type, "Unhandled lifecycle event, continuing to poll");
                    }
                    Err(err) => {
                        warn!("Lifecycle poll failed, retrying: {err}");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.poll_retry) => {}
                            reason = self.server.stopped() => {
                                return Err(self.listener_stopped(reason).await);
                            }
                        }
                    }
                },
                reason = self.server.stopped() => {
                    return Err(self.listener_stopped(reason).await);
                }
            }
        };

        let grace = effective_grace(
            self.config.shutdown_grace,
            deadline_ms,
            Utc::now().timestamp_millis(),
        );
        info!(grace_ms = grace.as_millis() as u64, "Draining credential service");
        let drain = self.server.shutdown(grace).await;

        Ok(ShutdownReport {
            reason,
            invocations,
            grace,
            drain,
        })
    }

    /// Tell the host the credential service died and build the error to exit with.
    async fn listener_stopped(&self, reason: String) -> SidecarError {
        error!("Credential service stopped unexpectedly: {reason}");
        if let Err(err) = self
            .client
            .report_exit_error(&self.identity, LISTENER_STOPPED_ERROR, &reason)
            .await
        {
            warn!("Failed to report exit error to host: {err}");
        }
        SidecarError::Listener(reason)
    }
}

/// The configured grace period, clipped to whatever time the host deadline
/// still leaves. A zero deadline means the host gave none.
fn effective_grace(configured: Duration, deadline_ms: u64, now_ms: i64) -> Duration {
    if deadline_ms == 0 {
        return configured;
    }
    let remaining = (deadline_ms as i64).saturating_sub(now_ms).max(0) as u64;
    configured.min(Duration::from_millis(remaining))
}
