//! Short-lived HS256 credentials for the function sharing this sandbox.
//!
//! The signing secret is read once at startup into an immutable
//! [`SigningContext`]. A [`CredentialIssuer`] holds the context behind an
//! `Arc` and is cloned into every request handler; nothing here is mutated
//! after construction, so concurrent requests never contend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::warn;
use uuid::Uuid;

use crate::DEFAULT_SIGNING_SECRET;
use crate::config::SigningConfig;
use crate::error::{Result, SidecarError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Claims carried inside every issued token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    /// Random per-credential id. Two credentials issued in the same second
    /// for the same subject still differ in signature.
    pub jti: String,
}

/// A freshly issued credential. Never stored; it only lives in the response.
#[derive(Clone, Debug, Serialize)]
pub struct Credential {
    pub token: String,
    pub subject: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

// ---------------------------------------------------------------------------
// Signing context
// ---------------------------------------------------------------------------

pub struct SigningContext {
    encoding: EncodingKey,
    decoding: DecodingKey,
    uses_fallback: bool,
}

impl SigningContext {
    /// Build the context from configuration. An absent or empty secret falls
    /// back to [`DEFAULT_SIGNING_SECRET`] and logs a warning.
    pub fn load(config: &SigningConfig) -> Self {
        match config.secret.as_deref().filter(|secret| !secret.is_empty()) {
            Some(secret) => Self::from_secret(secret.as_bytes()),
            None => {
                warn!("JWT_SECRET not set, signing credentials with the built-in fallback secret");
                let mut context = Self::from_secret(DEFAULT_SIGNING_SECRET.as_bytes());
                context.uses_fallback = true;
                context
            }
        }
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            uses_fallback: false,
        }
    }

    pub fn uses_fallback_secret(&self) -> bool {
        self.uses_fallback
    }
}

impl fmt::Debug for SigningContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningContext")
            .field("secret", &"<redacted>")
            .field("uses_fallback", &self.uses_fallback)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Issuer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CredentialIssuer {
    context: Arc<SigningContext>,
    subject: String,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(context: Arc<SigningContext>, subject: impl Into<String>, ttl: Duration) -> Self {
        Self {
            context,
            subject: subject.into(),
            ttl,
        }
    }

    /// Load the signing context and wrap it with the configured subject/TTL.
    pub fn from_config(config: &SigningConfig) -> Self {
        Self::new(
            Arc::new(SigningContext::load(config)),
            config.subject.clone(),
            config.ttl,
        )
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn context(&self) -> &SigningContext {
        &self.context
    }

    /// Sign a credential for `subject` expiring `ttl` from now.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<Credential> {
        let issued_at = now_secs();
        let expires_at = issued_at.checked_add(ttl.as_secs()).ok_or_else(|| {
            SidecarError::Signing(format!("Credential lifetime {}s is out of range", ttl.as_secs()))
        })?;
        let claims = CredentialClaims {
            sub: subject.to_string(),
            iat: issued_at,
            exp: expires_at,
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.context.encoding,
        )
        .map_err(|err| SidecarError::Signing(format!("Failed to sign credential: {err}")))?;

        Ok(Credential {
            token,
            subject: claims.sub,
            issued_at,
            expires_at,
        })
    }

    /// Sign a credential for the configured subject and TTL.
    pub fn issue_default(&self) -> Result<Credential> {
        self.issue(&self.subject, self.ttl)
    }

    /// Check a token's signature and expiry under this context's secret.
    pub fn verify(&self, token: &str) -> Result<CredentialClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<CredentialClaims>(token, &self.context.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| SidecarError::Signing(format!("Invalid credential: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer_with(secret: Option<&str>) -> CredentialIssuer {
        CredentialIssuer::from_config(&SigningConfig {
            secret: secret.map(str::to_string),
            subject: "user123".into(),
            ttl: Duration::from_secs(3600),
        })
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let credential = issuer.issue("alice", Duration::from_secs(120)).unwrap();

        let claims = issuer.verify(&credential.token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp, credential.expires_at);
        assert_eq!(claims.iat, credential.issued_at);
        assert_eq!(credential.subject, "alice");
    }

    #[test]
    fn expiry_is_issuance_plus_ttl() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let before = now_secs();
        let credential = issuer.issue("alice", Duration::from_secs(900)).unwrap();
        let after = now_secs();

        assert_eq!(credential.expires_at, credential.issued_at + 900);
        assert!(credential.issued_at >= before && credential.issued_at <= after);
    }

    #[test]
    fn out_of_range_ttl_is_signing_error() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let err = issuer
            .issue("alice", Duration::from_secs(u64::MAX))
            .unwrap_err();
        assert!(matches!(err, SidecarError::Signing(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn token_is_a_three_part_hs256_jwt() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let credential = issuer.issue_default().unwrap();
        assert_eq!(credential.token.split('.').count(), 3);

        let header = jsonwebtoken::decode_header(&credential.token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
    }

    #[test]
    fn fallback_secret_when_unset_or_empty() {
        let unset = issuer_with(None);
        assert!(unset.context().uses_fallback_secret());
        let empty = issuer_with(Some(""));
        assert!(empty.context().uses_fallback_secret());

        let credential = unset.issue_default().unwrap();
        let explicit_default = issuer_with(Some(DEFAULT_SIGNING_SECRET));
        assert!(!explicit_default.context().uses_fallback_secret());
        let claims = explicit_default.verify(&credential.token).unwrap();
        assert_eq!(claims.sub, "user123");
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signer = issuer_with(Some("secret-a"));
        let verifier = issuer_with(Some("secret-b"));
        let credential = signer.issue_default().unwrap();

        let err = verifier.verify(&credential.token).unwrap_err();
        assert!(matches!(err, SidecarError::Signing(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let now = now_secs();
        let claims = CredentialClaims {
            sub: "alice".into(),
            iat: now - 120,
            exp: now - 60,
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &issuer.context().encoding,
        )
        .unwrap();

        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn same_second_credentials_have_distinct_signatures() {
        let issuer = issuer_with(Some("unit-test-secret"));
        let a = issuer.issue_default().unwrap();
        let b = issuer.issue_default().unwrap();
        assert_ne!(a.token, b.token);

        let sig_a = a.token.rsplit('.').next().unwrap();
        let sig_b = b.token.rsplit('.').next().unwrap();
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    fn debug_never_prints_secret() {
        let context = SigningContext::from_secret(b"hunter2");
        let rendered = format!("{context:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
