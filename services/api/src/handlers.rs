//! Axum Handlers for the REST API
//!
//! `utoipa` path attributes on each handler feed the OpenAPI document.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use pivots_core::token::TokenError;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    models::{ErrorResponse, TokenResponse},
    state::AppState,
};

pub const TOKEN_FAILURE: &str = "Failed to fetch access token";

pub enum ApiError {
    TokenIssue(TokenError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::TokenIssue(err) => {
                let missing = match &err {
                    TokenError::Configuration { missing } => {
                        error!(error = %err, "token endpoint is not configured");
                        missing.iter().map(|name| name.to_string()).collect()
                    }
                    TokenError::Upstream(_) => {
                        error!(error = %err, "token issuance failed");
                        Vec::new()
                    }
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: TOKEN_FAILURE.to_string(),
                        details: Some(err.to_string()),
                        missing,
                    }),
                )
                    .into_response()
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        Self::TokenIssue(err)
    }
}

/// Issue a short-lived Hume EVI session token.
#[utoipa::path(
    get,
    path = "/api/hume-token",
    responses(
        (status = 200, description = "Session token issued", body = TokenResponse),
        (
            status = 500,
            description = "Credentials missing or token exchange failed",
            body = ErrorResponse
        )
    ),
    tag = "Voice session"
)]
#[instrument(skip(state))]
pub async fn get_access_token(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state.tokens.access_token().await?;
    info!(token_len = token.len(), "session token handed to client");
    Ok(Json(TokenResponse {
        access_token: token.expose().to_string(),
    }))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String)),
    tag = "Voice session"
)]
pub async fn health() -> &'static str {
    "ok"
}
