use hume_evi::{
    API_KEY_VAR, CONFIG_ID_VAR, Credentials, DEFAULT_CHAT_URL, DEFAULT_TOKEN_URL, SECRET_KEY_VAR,
};
use pivots_core::manager::DEFAULT_CONNECT_TIMEOUT;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

pub const DEFAULT_TOKEN_ENDPOINT: &str = "http://127.0.0.1:3000/api/hume-token";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Environment configuration for the terminal coach. Command-line flags are
/// layered on top in `main`.
#[derive(Debug)]
pub struct Config {
    /// Our own token-issuance route.
    pub token_endpoint: String,
    /// Where credentials are exchanged when running with `--direct`.
    pub oauth_token_url: String,
    pub chat_url: String,
    pub hume_api_key: Option<SecretString>,
    pub hume_secret_key: Option<SecretString>,
    pub hume_config_id: Option<String>,
    pub connect_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let connect_timeout = match var("COACH_CONNECT_TIMEOUT_SECS") {
            None => DEFAULT_CONNECT_TIMEOUT,
            Some(raw) => parse_timeout(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "COACH_CONNECT_TIMEOUT_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", raw),
                )
            })?,
        };

        Ok(Self {
            token_endpoint: var("COACH_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_ENDPOINT.to_string()),
            oauth_token_url: var("HUME_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            chat_url: var("HUME_CHAT_URL").unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            hume_api_key: var(API_KEY_VAR).map(SecretString::from),
            hume_secret_key: var(SECRET_KEY_VAR).map(SecretString::from),
            hume_config_id: var(CONFIG_ID_VAR),
            connect_timeout,
        })
    }

    pub fn credentials(&self) -> Credentials {
        let exposed = |s: &Option<SecretString>| s.as_ref().map(|v| v.expose_secret().to_owned());
        Credentials::new(
            exposed(&self.hume_api_key),
            exposed(&self.hume_secret_key),
            self.hume_config_id.clone(),
        )
    }
}

pub fn parse_timeout(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}
