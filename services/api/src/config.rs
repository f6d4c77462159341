use hume_evi::{API_KEY_VAR, CONFIG_ID_VAR, Credentials, DEFAULT_TOKEN_URL, SECRET_KEY_VAR};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// Hume credentials are optional here. The token route reports which ones are
/// missing on each request instead of refusing to boot.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub hume_api_key: Option<SecretString>,
    pub hume_secret_key: Option<SecretString>,
    pub hume_config_id: Option<String>,
    pub token_url: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let secret = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
        };
        let hume_api_key = secret(API_KEY_VAR);
        let hume_secret_key = secret(SECRET_KEY_VAR);
        let hume_config_id = std::env::var(CONFIG_ID_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty());

        let token_url =
            std::env::var("HUME_TOKEN_URL").unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string());
        if !token_url.starts_with("http://") && !token_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "HUME_TOKEN_URL".to_string(),
                format!("'{}' is not an http(s) URL", token_url),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            hume_api_key,
            hume_secret_key,
            hume_config_id,
            token_url,
            log_level,
        })
    }

    /// The credentials handed to the token provider.
    pub fn credentials(&self) -> Credentials {
        let exposed = |s: &Option<SecretString>| s.as_ref().map(|v| v.expose_secret().to_owned());
        Credentials::new(
            exposed(&self.hume_api_key),
            exposed(&self.hume_secret_key),
            self.hume_config_id.clone(),
        )
    }
}
