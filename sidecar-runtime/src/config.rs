//! Process configuration, read once from the environment at startup.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SidecarError};
use crate::extension::EventKind;
use crate::{
    DEFAULT_EXTENSION_NAME, DEFAULT_POLL_RETRY_MS, DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_SUBJECT,
    DEFAULT_TIMEOUT_SECS, DEFAULT_TOKEN_PORT, DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS,
};

/// Inputs for [`SigningContext`](crate::signing::SigningContext).
#[derive(Clone)]
pub struct SigningConfig {
    /// Raw `JWT_SECRET` value. `None` (or empty) selects the fallback secret.
    pub secret: Option<String>,
    /// Subject stamped on credentials issued by `GET /token`.
    pub subject: String,
    /// Lifetime of each issued credential.
    pub ttl: Duration,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("subject", &self.subject)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SidecarConfig {
    /// `host:port` of the Lambda runtime API (`AWS_LAMBDA_RUNTIME_API`).
    pub runtime_api: String,
    pub extension_name: String,
    pub events: Vec<EventKind>,
    pub signing: SigningConfig,
    /// Loopback port for the credential service. `0` picks an ephemeral port.
    pub port: u16,
    pub shutdown_grace: Duration,
    pub poll_retry: Duration,
    pub request_timeout: Duration,
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup. `from_env` passes
    /// `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let runtime_api = lookup("AWS_LAMBDA_RUNTIME_API")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SidecarError::Config("AWS_LAMBDA_RUNTIME_API not set".into()))?;

        let extension_name = lookup("LAMBDA_EXTENSION_NAME")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EXTENSION_NAME.to_string());

        let events = match lookup("LAMBDA_EXTENSION_EVENTS") {
            Some(raw) => parse_events(&raw)?,
            None => vec![EventKind::Invoke],
        };

        let secret = lookup("JWT_SECRET");
        let subject = lookup("TOKEN_SUBJECT")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());
        let ttl = lookup("TOKEN_TTL_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
            .min(MAX_TOKEN_TTL_SECS);

        let port = lookup("TOKEN_SERVICE_PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_TOKEN_PORT);
        let shutdown_grace = lookup("SHUTDOWN_GRACE_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);
        let poll_retry = lookup("EXTENSION_POLL_RETRY_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_RETRY_MS);
        let request_timeout = lookup("REQUEST_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(SidecarConfig {
            runtime_api,
            extension_name,
            events,
            signing: SigningConfig {
                secret,
                subject,
                ttl: Duration::from_secs(ttl),
            },
            port,
            shutdown_grace: Duration::from_millis(shutdown_grace),
            poll_retry: Duration::from_millis(poll_retry),
            request_timeout: Duration::from_secs(request_timeout),
        })
    }
}

/// Parse a comma-separated event subscription such as `INVOKE,SHUTDOWN`.
fn parse_events(raw: &str) -> Result<Vec<EventKind>> {
    let mut events = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let kind = part.parse::<EventKind>()?;
        if !events.contains(&kind) {
            events.push(kind);
        }
    }
    if events.is_empty() {
        return Err(SidecarError::Config(
            "LAMBDA_EXTENSION_EVENTS must name at least one event".into(),
        ));
    }
    Ok(events)
}
