//! Fetches session tokens from the service's own token-issuance route.

use crate::{API_KEY_VAR, CONFIG_ID_VAR, SECRET_KEY_VAR};
use async_trait::async_trait;
use pivots_core::token::{SessionToken, TokenError, TokenSource};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuedToken {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct IssueFailure {
    error: String,
    #[serde(default)]
    details: Option<String>,
    /// Present when the route itself lacks credentials.
    #[serde(default)]
    missing: Vec<String>,
}

impl IssueFailure {
    fn into_token_error(self, status: reqwest::StatusCode) -> TokenError {
        let missing: Vec<&'static str> = self
            .missing
            .iter()
            .filter_map(|name| {
                [API_KEY_VAR, SECRET_KEY_VAR, CONFIG_ID_VAR]
                    .into_iter()
                    .find(|known| *known == name.as_str())
            })
            .collect();
        if !missing.is_empty() {
            return TokenError::Configuration { missing };
        }
        match self.details {
            Some(details) => {
                TokenError::Upstream(format!("{} ({}): {}", self.error, status, details))
            }
            None => TokenError::Upstream(format!("{} ({})", self.error, status)),
        }
    }
}

/// A [`TokenSource`] backed by `GET /api/hume-token`.
pub struct EndpointTokenSource {
    http: reqwest::Client,
    url: String,
}

impl EndpointTokenSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for EndpointTokenSource {
    async fn access_token(&self) -> Result<SessionToken, TokenError> {
        debug!(url = %self.url, "requesting session token");
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TokenError::Upstream(format!("token endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(match response.json::<IssueFailure>().await {
                Ok(failure) => failure.into_token_error(status),
                Err(_) => TokenError::Upstream(format!("token endpoint returned {}", status)),
            });
        }

        let issued: IssuedToken = response
            .json()
            .await
            .map_err(|e| TokenError::Upstream(format!("malformed token response: {}", e)))?;
        SessionToken::new(issued.access_token.unwrap_or_default())
    }
}
