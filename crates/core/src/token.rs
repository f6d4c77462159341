//! Session tokens and the sources that issue them.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, sync::Arc};

/// Errors raised while obtaining a session token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// One or more required credentials are absent. Never retried.
    #[error("Missing required environment variables: {}", .missing.join(", "))]
    Configuration { missing: Vec<&'static str> },
    /// The exchange completed but produced nothing usable.
    #[error("Unable to get access token: {0}")]
    Upstream(String),
}

impl TokenError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, TokenError::Configuration { .. })
    }
}

/// A short-lived credential authorizing one real-time voice connection.
///
/// The value is never printed; `Debug` only reveals its length.
#[derive(Clone)]
pub struct SessionToken(Arc<SecretString>);

impl SessionToken {
    /// Wraps a raw token, rejecting empty values and the literal `"undefined"`.
    pub fn new(raw: String) -> Result<Self, TokenError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "undefined" {
            return Err(TokenError::Upstream(
                "token exchange returned no usable token".to_string(),
            ));
        }
        Ok(Self(Arc::new(SecretString::from(trimmed.to_string()))))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken(len={})", self.len())
    }
}

/// Anything that can hand out a fresh [`SessionToken`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<SessionToken, TokenError>;
}
