//! Voice-session core for the Deep Pivots interview coach.
//!
//! This crate owns the lifecycle of one real-time voice session: obtaining a
//! session token, acquiring the microphone, opening the vendor connection,
//! retrying unexpected drops and enforcing a connect timeout. Everything that
//! touches the outside world sits behind a capability trait so the
//! [`manager::ConnectionManager`] can be driven by fakes in tests.

pub mod device;
pub mod manager;
pub mod presentation;
pub mod retry;
pub mod token;
pub mod transport;

pub use device::{AudioCapture, AudioFormat, AudioInput, AudioStream, DeviceError};
pub use manager::{
    ConnectionManager, ConnectionStatus, SessionError, SessionOptions, SessionSnapshot,
};
pub use retry::RetryPolicy;
pub use token::{SessionToken, TokenError, TokenSource};
pub use transport::{
    ConnectRequest, ConnectionError, DisconnectReason, EventSink, RealtimeConnection,
    TransportEvent,
};
