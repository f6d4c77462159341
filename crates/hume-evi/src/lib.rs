//! Hume EVI adapters for the voice-session core.
//!
//! - `auth`: exchanges long-lived credentials for a session token.
//! - `endpoint`: fetches session tokens from our own token-issuance route.
//! - `types`: the JSON messages spoken on the EVI chat socket.
//! - `audio`: PCM helpers for feeding captured audio to the socket.
//! - `client`: the chat socket itself, as a `RealtimeConnection`.

pub mod audio;
pub mod auth;
pub mod client;
pub mod endpoint;
pub mod types;

pub use auth::{Credentials, TokenProvider};
pub use client::{EviConfig, EviConnection};
pub use endpoint::EndpointTokenSource;

pub const API_KEY_VAR: &str = "HUME_API_KEY";
pub const SECRET_KEY_VAR: &str = "HUME_SECRET_KEY";
pub const CONFIG_ID_VAR: &str = "HUME_CONFIG_ID";

pub const DEFAULT_TOKEN_URL: &str = "https://api.hume.ai/oauth2-cc/token";
pub const DEFAULT_CHAT_URL: &str = "wss://api.hume.ai/v0/evi/chat";
