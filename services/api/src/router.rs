//! Axum Router Configuration

use crate::{
    handlers,
    models::{ErrorResponse, TokenResponse},
    state::AppState,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::get_access_token, handlers::health),
    components(schemas(TokenResponse, ErrorResponse)),
    tags(
        (name = "Voice session", description = "Token issuance for the Deep Pivots voice coach")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/api/hume-token", get(handlers::get_access_token))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handlers::health))
        .merge(api_router)
}
