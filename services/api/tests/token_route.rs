//! Integration tests for the token-issuance route.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mockall::mock;
use pivots_api::{router::create_router, state::AppState};
use pivots_core::token::{SessionToken, TokenError, TokenSource};
use std::sync::Arc;
use tower::ServiceExt;

mock! {
    pub Tokens {}

    #[async_trait]
    impl TokenSource for Tokens {
        async fn access_token(&self) -> Result<SessionToken, TokenError>;
    }
}

fn test_app(tokens: MockTokens) -> axum::Router {
    create_router(Arc::new(AppState {
        tokens: Arc::new(tokens),
    }))
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_issues_token() {
    let mut tokens = MockTokens::new();
    tokens
        .expect_access_token()
        .times(1)
        .returning(|| Ok(SessionToken::new("session-123".to_string()).unwrap()));

    let (status, json) = get_json(test_app(tokens), "/api/hume-token").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!({ "accessToken": "session-123" }));
}

#[tokio::test]
async fn test_missing_credentials_are_reported() {
    let mut tokens = MockTokens::new();
    tokens.expect_access_token().returning(|| {
        Err(TokenError::Configuration {
            missing: vec!["HUME_SECRET_KEY"],
        })
    });

    let (status, json) = get_json(test_app(tokens), "/api/hume-token").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Failed to fetch access token");
    assert_eq!(
        json["details"],
        "Missing required environment variables: HUME_SECRET_KEY"
    );
    assert_eq!(json["missing"], serde_json::json!(["HUME_SECRET_KEY"]));
}

#[tokio::test]
async fn test_upstream_failure_is_reported() {
    let mut tokens = MockTokens::new();
    tokens
        .expect_access_token()
        .returning(|| Err(TokenError::Upstream("token endpoint returned 401".to_string())));

    let (status, json) = get_json(test_app(tokens), "/api/hume-token").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Failed to fetch access token");
    assert!(json["details"].as_str().unwrap().contains("401"));
    assert!(json.get("missing").is_none());
}

#[tokio::test]
async fn test_health() {
    let app = test_app(MockTokens::new());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_openapi_document_lists_token_route() {
    let (status, json) = get_json(test_app(MockTokens::new()), "/api-docs/openapi.json").await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["paths"].get("/api/hume-token").is_some());
    assert!(json["paths"].get("/health").is_some());
}
