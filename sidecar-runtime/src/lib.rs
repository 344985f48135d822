//! Lambda extension sidecar runtime.
//!
//! This crate provides the pieces of a sidecar that shares a Lambda execution
//! environment with a function: the Extensions API lifecycle client, the
//! signing context that mints short-lived credentials, the loopback HTTP
//! service the function calls to obtain them, and the orchestration that runs
//! both duties until the host asks the sandbox to shut down.

pub mod config;
pub mod error;
pub mod extension;
pub mod http;
pub mod server;
pub mod sidecar;
pub mod signing;
pub mod token_api;

pub use config::{SidecarConfig, SigningConfig};
pub use error::SidecarError;
pub use extension::{EventKind, ExtensionClient, ExtensionIdentity, LifecycleEvent};
pub use server::{DrainOutcome, TokenServer};
pub use sidecar::{RunningSidecar, ShutdownReport, Sidecar};
pub use signing::{Credential, CredentialClaims, CredentialIssuer, SigningContext};

/// Lambda Extensions API version segment in every lifecycle URL.
pub const EXTENSION_API_VERSION: &str = "2020-01-01";
pub const DEFAULT_EXTENSION_NAME: &str = "token-sidecar";
/// Fallback signing secret used when `JWT_SECRET` is unset. Deliberately weak:
/// kept for compatibility with existing callers, not as a recommendation.
pub const DEFAULT_SIGNING_SECRET: &str = "super_secret";
pub const DEFAULT_SUBJECT: &str = "user123";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
/// Upper bound applied to `TOKEN_TTL_SECS`.
pub const MAX_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
pub const DEFAULT_TOKEN_PORT: u16 = 8000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;
pub const DEFAULT_POLL_RETRY_MS: u64 = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
