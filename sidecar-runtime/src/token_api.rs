//! Axum router for the loopback credential API.
//!
//! Provides:
//! - `GET /token`: issue a short-lived credential for the configured subject
//! - everything else: a structured JSON 404, never a bare transport 404

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::SidecarError;
use crate::signing::CredentialIssuer;

pub const TOKEN_PATH: &str = "/token";
pub const TOKEN_ISSUED_MESSAGE: &str = "JWT token generated successfully";

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
    message: String,
    status: u16,
}

fn api_error(
    status: StatusCode,
    error: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: error.into(),
            message: message.into(),
            status: status.as_u16(),
        }),
    )
}

impl IntoResponse for SidecarError {
    fn into_response(self) -> Response {
        match self {
            SidecarError::Signing(msg) => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Credential issuance failed",
                msg,
            )
            .into_response(),
            other => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                other.to_string(),
            )
            .into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    expires_at: u64,
    user_id: String,
    message: String,
}

async fn issue_token(State(issuer): State<CredentialIssuer>) -> Response {
    match issuer.issue_default() {
        Ok(credential) => (
            StatusCode::OK,
            Json(TokenResponse {
                token: credential.token,
                expires_at: credential.expires_at,
                user_id: credential.subject,
                message: TOKEN_ISSUED_MESSAGE.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Credential issuance failed: {e}");
            e.into_response()
        }
    }
}

async fn not_found() -> impl IntoResponse {
    api_error(
        StatusCode::NOT_FOUND,
        "Endpoint not found",
        "Use /token to get a credential",
    )
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

/// Build the credential API router. Any method other than GET on `/token`
/// gets the same structured 404 as an unknown path. HEAD is routed
/// explicitly because axum would otherwise answer it with the GET handler.
pub fn token_router(issuer: CredentialIssuer) -> Router {
    Router::new()
        .route(
            TOKEN_PATH,
            get(issue_token).head(not_found).fallback(not_found),
        )
        .fallback(not_found)
        .with_state(issuer)
        .layer(TraceLayer::new_for_http())
}
