//! Client-credentials exchange against the Hume OAuth endpoint.

use crate::{API_KEY_VAR, CONFIG_ID_VAR, DEFAULT_TOKEN_URL, SECRET_KEY_VAR};
use async_trait::async_trait;
use pivots_core::token::{SessionToken, TokenError, TokenSource};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

/// Long-lived credentials. Every field is optional here; presence is checked
/// each time a token is requested.
#[derive(Default)]
pub struct Credentials {
    pub api_key: Option<SecretString>,
    pub secret_key: Option<SecretString>,
    pub config_id: Option<String>,
}

impl Credentials {
    pub fn new(
        api_key: Option<String>,
        secret_key: Option<String>,
        config_id: Option<String>,
    ) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            api_key: non_empty(api_key).map(SecretString::from),
            secret_key: non_empty(secret_key).map(SecretString::from),
            config_id: non_empty(config_id),
        }
    }

    /// Names of the required credentials that are absent, in a fixed order.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.is_none() {
            missing.push(API_KEY_VAR);
        }
        if self.secret_key.is_none() {
            missing.push(SECRET_KEY_VAR);
        }
        if self.config_id.is_none() {
            missing.push(CONFIG_ID_VAR);
        }
        missing
    }

    fn log_presence(&self) {
        debug!(
            has_api_key = self.api_key.is_some(),
            has_secret_key = self.secret_key.is_some(),
            has_config_id = self.config_id.is_some(),
            api_key_len = self.api_key.as_ref().map(|k| k.expose_secret().len()),
            secret_key_len = self.secret_key.as_ref().map(|k| k.expose_secret().len()),
            "credential check"
        );
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Issues session tokens from long-lived credentials.
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    credentials: Credentials,
}

impl TokenProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_token_url(credentials, DEFAULT_TOKEN_URL)
    }

    pub fn with_token_url(credentials: Credentials, token_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            credentials,
        }
    }

    /// Exchanges the configured credentials for a fresh session token.
    pub async fn get_access_token(&self) -> Result<SessionToken, TokenError> {
        self.credentials.log_presence();
        let (Some(api_key), Some(secret_key), Some(_)) = (
            &self.credentials.api_key,
            &self.credentials.secret_key,
            &self.credentials.config_id,
        ) else {
            return Err(TokenError::Configuration {
                missing: self.credentials.missing(),
            });
        };

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(api_key.expose_secret(), Some(secret_key.expose_secret()))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| TokenError::Upstream(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Upstream(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Upstream(format!("malformed token response: {}", e)))?;
        let token = SessionToken::new(body.access_token.unwrap_or_default())?;
        info!(expires_in = body.expires_in, token_len = token.len(), "issued session token");
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for TokenProvider {
    async fn access_token(&self) -> Result<SessionToken, TokenError> {
        self.get_access_token().await
    }
}
