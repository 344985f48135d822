//! Lambda Extensions API client.
//!
//! Lifecycle of a registered extension:
//! 1. `POST /2020-01-01/extension/register` with the event subscription.
//!    The host answers with a `Lambda-Extension-Identifier` header.
//! 2. `GET /2020-01-01/extension/event/next` with that identifier, repeated
//!    after every event. The host holds the call open until the next phase.
//! 3. On `SHUTDOWN` the extension stops polling and exits.

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::EXTENSION_API_VERSION;
use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};
use crate::http::{build_url, header_map, lifecycle_client};

pub const EXTENSION_NAME_HEADER: &str = "lambda-extension-name";
pub const EXTENSION_IDENTIFIER_HEADER: &str = "lambda-extension-identifier";
pub const FUNCTION_ERROR_TYPE_HEADER: &str = "lambda-extension-function-error-type";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Event kinds an extension can subscribe to at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Invoke,
    Shutdown,
}

impl FromStr for EventKind {
    type Err = SidecarError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("INVOKE") {
            Ok(EventKind::Invoke)
        } else if s.eq_ignore_ascii_case("SHUTDOWN") {
            Ok(EventKind::Shutdown)
        } else {
            Err(SidecarError::Config(format!("Unknown extension event '{s}'")))
        }
    }
}

/// Opaque identity issued by the host at registration.
///
/// Only [`ExtensionClient::register`] can produce one, so holding an
/// `ExtensionIdentity` is proof that registration succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionIdentity(String);

impl ExtensionIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One event delivered by `event/next`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Invoke {
        request_id: String,
        deadline_ms: u64,
        invoked_function_arn: Option<String>,
    },
    Shutdown {
        reason: String,
        deadline_ms: u64,
    },
    /// Any event type this sidecar does not act on.
    Error {
        event_type: String,
        deadline_ms: Option<u64>,
    },
}

/// Wire form of an event descriptor.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDescriptor {
    event_type: String,
    #[serde(default)]
    deadline_ms: Option<u64>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    invoked_function_arn: Option<String>,
    #[serde(default)]
    shutdown_reason: Option<String>,
}

impl LifecycleEvent {
    /// Decode an `event/next` response body.
    pub fn from_json(body: &str) -> Result<Self> {
        let raw: EventDescriptor = serde_json::from_str(body)
            .map_err(|err| SidecarError::Poll(format!("Invalid event descriptor: {err}")))?;

        let event = match raw.event_type.as_str() {
            "INVOKE" => LifecycleEvent::Invoke {
                request_id: raw.request_id.unwrap_or_default(),
                deadline_ms: raw.deadline_ms.unwrap_or_default(),
                invoked_function_arn: raw.invoked_function_arn,
            },
            "SHUTDOWN" => LifecycleEvent::Shutdown {
                reason: raw.shutdown_reason.unwrap_or_else(|| "unspecified".to_string()),
                deadline_ms: raw.deadline_ms.unwrap_or_default(),
            },
            _ => LifecycleEvent::Error {
                event_type: raw.event_type,
                deadline_ms: raw.deadline_ms,
            },
        };
        Ok(event)
    }

    /// Host deadline in unix milliseconds, when the host supplied one.
    pub fn deadline_ms(&self) -> Option<u64> {
        match self {
            LifecycleEvent::Invoke { deadline_ms, .. }
            | LifecycleEvent::Shutdown { deadline_ms, .. } => {
                Some(*deadline_ms).filter(|ms| *ms > 0)
            }
            LifecycleEvent::Error { deadline_ms, .. } => *deadline_ms,
        }
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    events: &'a [EventKind],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport<'a> {
    error_message: &'a str,
    error_type: &'a str,
    stack_trace: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ExtensionClient {
    name: String,
    client: Client,
    request_timeout: Duration,
    register_url: Url,
    next_url: Url,
    exit_error_url: Url,
    identity: OnceCell<ExtensionIdentity>,
}

impl ExtensionClient {
    /// Build a client for the Extensions API at `runtime_api` (`host:port`
    /// or a full URL). No request is sent until [`register`](Self::register).
    pub fn new(
        runtime_api: &str,
        name: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let endpoint =
            |path: &str| build_url(runtime_api, &format!("/{EXTENSION_API_VERSION}/extension{path}"));

        Ok(Self {
            name: name.into(),
            client: lifecycle_client(request_timeout)?,
            request_timeout,
            register_url: endpoint("/register")?,
            next_url: endpoint("/event/next")?,
            exit_error_url: endpoint("/exit/error")?,
            identity: OnceCell::new(),
        })
    }

    pub fn from_config(config: &SidecarConfig) -> Result<Self> {
        Self::new(
            &config.runtime_api,
            config.extension_name.clone(),
            config.request_timeout,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity from a successful registration, if any.
    pub fn identity(&self) -> Option<&ExtensionIdentity> {
        self.identity.get()
    }

    /// Register with the host and return the issued identity.
    ///
    /// Every failure here is fatal to the process: without an identity no
    /// further lifecycle call is valid. A second call is rejected even if the
    /// first one succeeded.
    pub async fn register(&self, events: &[EventKind]) -> Result<ExtensionIdentity> {
        if self.identity.get().is_some() {
            return Err(SidecarError::Registration(
                "extension already registered".into(),
            ));
        }
        if !events.contains(&EventKind::Invoke) {
            return Err(SidecarError::Config(
                "registration must subscribe to INVOKE".into(),
            ));
        }

        info!(extension = %self.name, ?events, "Registering extension");
        let headers = header_map(&[(EXTENSION_NAME_HEADER, self.name.as_str())])?;

        let response = self
            .client
            .post(self.register_url.clone())
            .timeout(self.request_timeout)
            .headers(headers)
            .json(&RegisterRequest { events })
            .send()
            .await
            .map_err(|err| {
                SidecarError::Registration(format!("Cannot reach Extensions API: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SidecarError::Registration(format!("HTTP {status}: {text}")));
        }

        let identifier = response
            .headers()
            .get(EXTENSION_IDENTIFIER_HEADER)
            .ok_or_else(|| {
                SidecarError::Registration(
                    "register response missing 'Lambda-Extension-Identifier' header".into(),
                )
            })?
            .to_str()
            .map_err(|_| {
                SidecarError::Registration(
                    "'Lambda-Extension-Identifier' header is not valid ASCII".into(),
                )
            })?
            .trim()
            .to_string();

        if identifier.is_empty() {
            return Err(SidecarError::Registration(
                "'Lambda-Extension-Identifier' header is empty".into(),
            ));
        }

        let identity = ExtensionIdentity(identifier);
        self.identity.set(identity.clone()).map_err(|_| {
            SidecarError::Registration("extension already registered".into())
        })?;

        info!(extension = %self.name, identity = %identity, "Extension registered");
        Ok(identity)
    }

    /// Block until the host delivers the next lifecycle event.
    ///
    /// There is no client-side timeout: the host may hold this call open for
    /// as long as the sandbox is frozen. Failures are recoverable.
    pub async fn next_event(&self, identity: &ExtensionIdentity) -> Result<LifecycleEvent> {
        let response = self
            .client
            .get(self.next_url.clone())
            .header(EXTENSION_IDENTIFIER_HEADER, identity.as_str())
            .send()
            .await
            .map_err(|err| SidecarError::Poll(format!("event/next request failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SidecarError::Poll(format!("Failed to read event body: {err}")))?;

        if !status.is_success() {
            return Err(SidecarError::Poll(format!("HTTP {status}: {body}")));
        }

        let event = LifecycleEvent::from_json(&body)?;
        debug!(?event, "Received lifecycle event");
        Ok(event)
    }

    /// Tell the host this extension is exiting because of an error.
    /// `error_type` follows the `Extension.<Reason>` convention.
    pub async fn report_exit_error(
        &self,
        identity: &ExtensionIdentity,
        error_type: &str,
        message: &str,
    ) -> Result<()> {
        let headers = header_map(&[
            (EXTENSION_IDENTIFIER_HEADER, identity.as_str()),
            (FUNCTION_ERROR_TYPE_HEADER, error_type),
        ])?;

        let response = self
            .client
            .post(self.exit_error_url.clone())
            .timeout(self.request_timeout)
            .headers(headers)
            .json(&ErrorReport {
                error_message: message,
                error_type,
                stack_trace: Vec::new(),
            })
            .send()
            .await
            .map_err(|err| SidecarError::Poll(format!("exit/error request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SidecarError::Poll(format!("exit/error HTTP {status}: {text}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_as_host_expects() {
        let body = serde_json::to_string(&RegisterRequest {
            events: &[EventKind::Invoke],
        })
        .unwrap();
        assert_eq!(body, r#"{"events":["INVOKE"]}"#);

        let both = serde_json::to_string(&RegisterRequest {
            events: &[EventKind::Invoke, EventKind::Shutdown],
        })
        .unwrap();
        assert_eq!(both, r#"{"events":["INVOKE","SHUTDOWN"]}"#);
    }

    #[test]
    fn event_kind_parses_case_insensitively() {
        assert_eq!("invoke".parse::<EventKind>().unwrap(), EventKind::Invoke);
        assert_eq!("SHUTDOWN".parse::<EventKind>().unwrap(), EventKind::Shutdown);
        assert!("RESTORE".parse::<EventKind>().is_err());
    }

    #[test]
    fn parses_invoke_event() {
        let body = r#"{
            "eventType": "INVOKE",
            "deadlineMs": 1596036827000,
            "requestId": "3da1f2dc-3222-475e-9205-e2e6c6318895",
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:demo",
            "tracing": { "type": "X-Amzn-Trace-Id", "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2" }
        }"#;
        let event = LifecycleEvent::from_json(body).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Invoke {
                request_id: "3da1f2dc-3222-475e-9205-e2e6c6318895".into(),
                deadline_ms: 1596036827000,
                invoked_function_arn: Some(
                    "arn:aws:lambda:us-east-1:123456789012:function:demo".into()
                ),
            }
        );
        assert_eq!(event.deadline_ms(), Some(1596036827000));
    }

    #[test]
    fn parses_shutdown_event() {
        let body = r#"{"eventType":"SHUTDOWN","shutdownReason":"spindown","deadlineMs":1596036829000}"#;
        let event = LifecycleEvent::from_json(body).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Shutdown {
                reason: "spindown".into(),
                deadline_ms: 1596036829000,
            }
        );
    }

    #[test]
    fn unknown_event_type_maps_to_error() {
        let event = LifecycleEvent::from_json(r#"{"eventType":"RESTORE"}"#).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Error {
                event_type: "RESTORE".into(),
                deadline_ms: None,
            }
        );
        assert_eq!(event.deadline_ms(), None);
    }

    #[test]
    fn malformed_event_is_recoverable_poll_error() {
        let err = LifecycleEvent::from_json("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, SidecarError::Poll(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn new_builds_versioned_endpoints() {
        let client =
            ExtensionClient::new("127.0.0.1:9001", "token-sidecar", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.register_url.as_str(),
            "http://127.0.0.1:9001/2020-01-01/extension/register"
        );
        assert_eq!(
            client.next_url.as_str(),
            "http://127.0.0.1:9001/2020-01-01/extension/event/next"
        );
        assert_eq!(
            client.exit_error_url.as_str(),
            "http://127.0.0.1:9001/2020-01-01/extension/exit/error"
        );
        assert!(client.identity().is_none());
    }
}
