//! The real-time connection capability and the events it reports.
//!
//! A [`RealtimeConnection`] is the vendor-managed socket the manager does not
//! own. It reports state through an [`EventSink`] that is bound to the
//! attempt epoch which opened it, so reports from superseded attempts never
//! reach shared state.

use crate::{device::AudioStream, token::SessionToken};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

/// Why a real-time connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local user hung up. Never retried.
    UserInitiated,
    /// The remote end closed the socket.
    Closed { code: u16, reason: String },
    /// The socket failed underneath us.
    Failed(String),
}

impl DisconnectReason {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, DisconnectReason::UserInitiated)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserInitiated => write!(f, "user_initiated"),
            DisconnectReason::Closed { code, reason } if reason.is_empty() => {
                write!(f, "closed ({})", code)
            }
            DisconnectReason::Closed { code, reason } => write!(f, "closed ({}): {}", code, reason),
            DisconnectReason::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// State changes reported by a [`RealtimeConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed(DisconnectReason),
}

/// Failures establishing the real-time session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to build connection request: {0}")]
    Request(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to obtain session token: {0}")]
    Token(String),
    #[error("attempt was superseded before the connection opened")]
    Superseded,
}

/// Everything the transport needs to open one session.
#[derive(Debug)]
pub struct ConnectRequest {
    pub token: SessionToken,
    pub audio: Option<AudioStream>,
}

type Deliver = dyn Fn(u64, TransportEvent) + Send + Sync;

/// Epoch-tagged handle a transport uses to report state changes.
#[derive(Clone)]
pub struct EventSink {
    epoch: u64,
    current: Arc<AtomicU64>,
    deliver: Arc<Deliver>,
}

impl EventSink {
    /// Binds `deliver` to `epoch`. Events are only delivered while `current`
    /// still holds that epoch.
    pub fn new<F>(epoch: u64, current: Arc<AtomicU64>, deliver: F) -> Self
    where
        F: Fn(u64, TransportEvent) + Send + Sync + 'static,
    {
        Self {
            epoch,
            current,
            deliver: Arc::new(deliver),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the attempt this sink belongs to is still the live one.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    pub fn emit(&self, event: TransportEvent) {
        if !self.is_current() {
            debug!(epoch = self.epoch, ?event, "dropping event from superseded attempt");
            return;
        }
        (self.deliver)(self.epoch, event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("epoch", &self.epoch)
            .field("current", &self.current.load(Ordering::SeqCst))
            .finish()
    }
}

/// The vendor's real-time connection, abstracted so the manager never depends
/// on a concrete client.
#[async_trait]
pub trait RealtimeConnection: Send + Sync {
    /// Opens a session. Implementations report `Opened` and later `Closed`
    /// through `sink`; a returned error means the open call itself failed.
    async fn connect(&self, request: ConnectRequest, sink: EventSink)
    -> Result<(), ConnectionError>;

    /// Severs the current session, if any.
    async fn disconnect(&self);
}
