//! Lifecycle of one real-time voice session.
//!
//! The [`ConnectionManager`] is the only mutator of connection state. Every
//! attempt is identified by an epoch minted under the state lock; results and
//! transport events carrying an older epoch are dropped, which is how a
//! superseded attempt is "cancelled" without touching shared state.
//!
//! State changes are published on a `watch` channel so a presentation layer can
//! re-render without polling.

use crate::{
    device::{AudioCapture, AudioInput, DeviceError},
    retry::RetryPolicy,
    token::{SessionToken, TokenError, TokenSource},
    transport::{
        ConnectRequest, ConnectionError, DisconnectReason, EventSink, RealtimeConnection,
        TransportEvent,
    },
};
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const TIMEOUT_MESSAGE: &str = "Timed out connecting to the voice coach. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// A point-in-time view of the session, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    /// True from `connect()` until the attempt connects, fails terminally,
    /// times out or is torn down. Stays true while a retry is pending.
    pub is_connecting: bool,
    pub retry_count: u32,
    pub epoch: u64,
    /// Human-readable description of the last failure, if any.
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            is_connecting: false,
            retry_count: 0,
            epoch: 0,
            last_error: None,
        }
    }
}

/// Errors returned from [`ConnectionManager::connect`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Configuration(TokenError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("connection manager has been shut down")]
    ShutDown,
}

/// Tunables for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// A token supplied by the caller. When set, the token source is never asked.
    pub access_token: Option<SessionToken>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            access_token: None,
        }
    }
}

struct Inner {
    status: ConnectionStatus,
    in_flight: bool,
    retry_count: u32,
    last_error: Option<String>,
    connect_timeout: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    capture: Option<Box<dyn AudioCapture>>,
    shut_down: bool,
}

impl Inner {
    fn clear_timers(&mut self) {
        if let Some(handle) = self.connect_timeout.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_timer.take() {
            handle.abort();
        }
    }

    /// Ends the current attempt and returns to an idle-equivalent state.
    fn settle(&mut self, error: Option<String>) {
        self.clear_timers();
        self.capture = None;
        self.in_flight = false;
        self.retry_count = 0;
        self.status = ConnectionStatus::Disconnected;
        self.last_error = error;
    }
}

struct Shared {
    transport: Arc<dyn RealtimeConnection>,
    device: Arc<dyn AudioInput>,
    tokens: Arc<dyn TokenSource>,
    options: SessionOptions,
    epoch: Arc<AtomicU64>,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        inner.clear_timers();
    }
}

/// Owns the lifecycle of one real-time voice session.
///
/// Cloning is cheap; all clones drive the same session. Timers only hold weak
/// references, so dropping the last clone cancels anything still pending.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn RealtimeConnection>,
        device: Arc<dyn AudioInput>,
        tokens: Arc<dyn TokenSource>,
        options: SessionOptions,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::initial());
        Self {
            shared: Arc::new(Shared {
                transport,
                device,
                tokens,
                options,
                epoch: Arc::new(AtomicU64::new(0)),
                inner: Mutex::new(Inner {
                    status: ConnectionStatus::Idle,
                    in_flight: false,
                    retry_count: 0,
                    last_error: None,
                    connect_timeout: None,
                    retry_timer: None,
                    capture: None,
                    shut_down: false,
                }),
                snapshots,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Starts a connection attempt.
    ///
    /// Does nothing when an attempt is already in flight (including while a
    /// retry is pending) or the session is already connected. Device and
    /// configuration errors end the attempt immediately; any other failure is
    /// returned after being handed to the retry logic.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let epoch = {
            let mut inner = self.lock();
            if inner.shut_down {
                return Err(SessionError::ShutDown);
            }
            if inner.in_flight {
                debug!(
                    epoch = self.current_epoch(),
                    "connect ignored: attempt already in flight"
                );
                return Ok(());
            }
            if inner.status == ConnectionStatus::Connected {
                debug!("connect ignored: already connected");
                return Ok(());
            }
            inner.in_flight = true;
            inner.status = ConnectionStatus::Connecting;
            inner.last_error = None;
            let epoch = self.mint_epoch(&mut inner);
            self.publish(&inner);
            epoch
        };
        info!(epoch, "starting connection attempt");
        self.run_attempt(epoch).await
    }

    /// Abandons whatever is in progress and starts a fresh attempt.
    ///
    /// Results of the abandoned attempt that arrive later are discarded.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        let (epoch, was_live) = {
            let mut inner = self.lock();
            if inner.shut_down {
                return Err(SessionError::ShutDown);
            }
            let was_live = inner.in_flight || inner.status == ConnectionStatus::Connected;
            inner.clear_timers();
            inner.capture = None;
            inner.in_flight = true;
            inner.retry_count = 0;
            inner.status = ConnectionStatus::Connecting;
            inner.last_error = None;
            let epoch = self.mint_epoch(&mut inner);
            self.publish(&inner);
            (epoch, was_live)
        };
        if was_live {
            self.shared.transport.disconnect().await;
        }
        info!(epoch, "restarting connection attempt");
        self.run_attempt(epoch).await
    }

    /// Hangs up. Never followed by an automatic retry.
    pub async fn disconnect(&self) {
        self.end_session(false).await;
        info!("session ended by user");
    }

    /// Tears the manager down: cancels all timers, clears the in-flight flag
    /// and severs the connection. Later `connect()` calls fail.
    pub async fn shutdown(&self) {
        self.end_session(true).await;
        info!("connection manager shut down");
    }

    async fn end_session(&self, shut_down: bool) {
        {
            let mut inner = self.lock();
            let idle = inner.status == ConnectionStatus::Idle;
            inner.settle(None);
            if idle {
                inner.status = ConnectionStatus::Idle;
            }
            inner.shut_down |= shut_down;
            self.mint_epoch(&mut inner);
            self.publish(&inner);
        }
        self.shared.transport.disconnect().await;
    }

    async fn run_attempt(&self, epoch: u64) -> Result<(), SessionError> {
        let mut capture = match self.shared.device.acquire().await {
            Ok(capture) => capture,
            Err(err) => {
                if !self.is_current(epoch) {
                    debug!(epoch, error = %err, "discarding device failure of superseded attempt");
                    return Ok(());
                }
                warn!(epoch, error = %err, "audio input unavailable");
                self.fail_attempt(epoch, err.user_message().to_string());
                return Err(err.into());
            }
        };
        if !self.is_current(epoch) {
            debug!(epoch, "attempt superseded while acquiring audio input");
            return Ok(());
        }

        let token = match self.session_token().await {
            Ok(token) => token,
            Err(err) if !self.is_current(epoch) => {
                debug!(epoch, error = %err, "discarding token failure of superseded attempt");
                return Ok(());
            }
            Err(err) if err.is_configuration() => {
                error!(epoch, error = %err, "token provider is misconfigured");
                self.fail_attempt(epoch, err.to_string());
                return Err(SessionError::Configuration(err));
            }
            Err(err) => {
                let err = ConnectionError::Token(err.to_string());
                warn!(epoch, error = %err, "could not obtain session token");
                self.handle_event(
                    epoch,
                    TransportEvent::Closed(DisconnectReason::Failed(err.to_string())),
                );
                return Err(err.into());
            }
        };

        let audio = capture.take_stream();
        {
            let mut inner = self.lock();
            if !self.is_current(epoch) {
                debug!(epoch, "attempt superseded while fetching session token");
                return Ok(());
            }
            inner.capture = Some(capture);
            inner.connect_timeout = Some(self.arm_connect_timeout(epoch));
        }

        debug!(epoch, token = ?token, "opening real-time connection");
        let request = ConnectRequest { token, audio };
        match self.shared.transport.connect(request, self.sink(epoch)).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::Superseded) => {
                debug!(epoch, "transport abandoned superseded attempt");
                Ok(())
            }
            Err(err) if !self.is_current(epoch) => {
                debug!(epoch, error = %err, "discarding open failure of superseded attempt");
                Ok(())
            }
            Err(err) => {
                warn!(epoch, error = %err, "failed to open real-time connection");
                self.handle_event(
                    epoch,
                    TransportEvent::Closed(DisconnectReason::Failed(err.to_string())),
                );
                Err(err.into())
            }
        }
    }

    async fn session_token(&self) -> Result<SessionToken, TokenError> {
        match &self.shared.options.access_token {
            Some(token) => Ok(token.clone()),
            None => self.shared.tokens.access_token().await,
        }
    }

    /// Ends the attempt for a reason that must not be retried.
    fn fail_attempt(&self, epoch: u64, message: String) {
        let mut inner = self.lock();
        if !self.is_current(epoch) {
            return;
        }
        inner.settle(Some(message));
        self.publish(&inner);
    }

    fn handle_event(&self, epoch: u64, event: TransportEvent) {
        let mut inner = self.lock();
        if !self.is_current(epoch) {
            debug!(epoch, ?event, "discarding event from superseded attempt");
            return;
        }
        match event {
            TransportEvent::Opened => {
                inner.clear_timers();
                inner.retry_count = 0;
                inner.in_flight = false;
                inner.status = ConnectionStatus::Connected;
                inner.last_error = None;
                info!(epoch, "real-time session connected");
            }
            TransportEvent::Closed(reason) => self.on_closed(&mut inner, epoch, reason),
        }
        self.publish(&inner);
    }

    fn on_closed(&self, inner: &mut Inner, epoch: u64, reason: DisconnectReason) {
        if let Some(handle) = inner.connect_timeout.take() {
            handle.abort();
        }
        inner.capture = None;

        // Retries are gated on the authoritative in-flight flag, read under the lock.
        if !inner.in_flight || reason.is_user_initiated() {
            let error =
                (!reason.is_user_initiated()).then(|| format!("Connection lost ({})", reason));
            info!(epoch, %reason, "real-time session disconnected");
            inner.settle(error);
            return;
        }

        inner.status = ConnectionStatus::Disconnected;
        let policy = self.shared.options.retry;
        match policy.delay_for(inner.retry_count) {
            Some(delay) => {
                inner.retry_count += 1;
                warn!(
                    epoch,
                    %reason,
                    retry = inner.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "unexpected disconnect, scheduling retry"
                );
                if let Some(handle) = inner.retry_timer.take() {
                    handle.abort();
                }
                inner.retry_timer = Some(self.schedule_retry(epoch, delay));
            }
            None => {
                error!(epoch, %reason, "giving up after exhausting retries");
                inner.settle(Some(format!(
                    "Unable to connect after {} retries ({})",
                    policy.max_retries, reason
                )));
            }
        }
    }

    fn arm_connect_timeout(&self, epoch: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.options.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else { return };
            let manager = ConnectionManager { shared };
            if manager.expire_attempt(epoch) {
                manager.shared.transport.disconnect().await;
            }
        })
    }

    /// Called when the connect timeout fires. Returns whether the attempt was
    /// still pending and has now been abandoned.
    fn expire_attempt(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if !self.is_current(epoch) || inner.status != ConnectionStatus::Connecting {
            return false;
        }
        // This is the running timer's own handle: detach it instead of aborting.
        drop(inner.connect_timeout.take());
        inner.settle(Some(TIMEOUT_MESSAGE.to_string()));
        self.mint_epoch(&mut inner);
        warn!(
            epoch,
            timeout_ms = self.shared.options.connect_timeout.as_millis() as u64,
            "connect timed out, disconnecting"
        );
        self.publish(&inner);
        true
    }

    fn schedule_retry(&self, epoch: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            ConnectionManager { shared }.retry(epoch).await;
        })
    }

    async fn retry(&self, scheduled_by: u64) {
        let epoch = {
            let mut inner = self.lock();
            if !self.is_current(scheduled_by) || !inner.in_flight {
                debug!(epoch = scheduled_by, "stale retry timer fired");
                return;
            }
            drop(inner.retry_timer.take());
            inner.status = ConnectionStatus::Connecting;
            let epoch = self.mint_epoch(&mut inner);
            info!(epoch, retry = inner.retry_count, "retrying connection");
            self.publish(&inner);
            epoch
        };
        if let Err(err) = self.run_attempt(epoch).await {
            debug!(epoch, error = %err, "retry attempt failed");
        }
    }

    fn sink(&self, epoch: u64) -> EventSink {
        let weak = Arc::downgrade(&self.shared);
        EventSink::new(epoch, self.shared.epoch.clone(), move |epoch, event| {
            if let Some(shared) = weak.upgrade() {
                ConnectionManager { shared }.handle_event(epoch, event);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current_epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    /// Requires the state lock so minting and the state change it guards are atomic.
    fn mint_epoch(&self, _inner: &mut MutexGuard<'_, Inner>) -> u64 {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, inner: &Inner) {
        let snapshot = SessionSnapshot {
            status: inner.status,
            is_connecting: inner.in_flight,
            retry_count: inner.retry_count,
            epoch: self.current_epoch(),
            last_error: inner.last_error.clone(),
        };
        self.shared.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{AudioFormat, AudioStream},
        token::MockTokenSource,
    };
    use async_trait::async_trait;
    use mockall::Sequence;
    use std::{
        collections::VecDeque,
        sync::atomic::AtomicUsize,
    };
    use tokio::{
        sync::{mpsc, oneshot},
        time::Instant,
    };

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 1,
    };

    struct FakeCapture {
        stream: Option<AudioStream>,
    }

    impl AudioCapture for FakeCapture {
        fn take_stream(&mut self) -> Option<AudioStream> {
            self.stream.take()
        }
    }

    #[derive(Default)]
    struct FakeDevice {
        failure: Option<fn() -> DeviceError>,
        gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
        acquisitions: AtomicUsize,
    }

    impl FakeDevice {
        fn failing(failure: fn() -> DeviceError) -> Self {
            Self {
                failure: Some(failure),
                ..Default::default()
            }
        }

        /// Holds the next acquisition until the returned sender fires.
        fn gate(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push_back(rx);
            tx
        }

        fn acquisitions(&self) -> usize {
            self.acquisitions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioInput for FakeDevice {
        async fn acquire(&self) -> Result<Box<dyn AudioCapture>, DeviceError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            let gate = self.gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            let (_tx, frames) = mpsc::channel(1);
            Ok(Box::new(FakeCapture {
                stream: Some(AudioStream {
                    format: FORMAT,
                    frames,
                }),
            }))
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Open {
        /// Reports `Opened` before returning.
        Succeed,
        /// Returns without reporting anything; the test drives the sink.
        Pending,
        Fail,
        /// Never returns.
        Hang,
    }

    struct FakeTransport {
        script: Mutex<VecDeque<Open>>,
        fallback: Open,
        opens: Mutex<Vec<Instant>>,
        sinks: Mutex<Vec<EventSink>>,
        disconnects: AtomicUsize,
    }

    impl FakeTransport {
        fn scripted(script: impl IntoIterator<Item = Open>, fallback: Open) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                opens: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }

        fn always(behavior: Open) -> Arc<Self> {
            Self::scripted([], behavior)
        }

        fn open_count(&self) -> usize {
            self.opens.lock().unwrap().len()
        }

        fn open_offsets(&self, start: Instant) -> Vec<Duration> {
            self.opens
                .lock()
                .unwrap()
                .iter()
                .map(|at| at.duration_since(start))
                .collect()
        }

        fn last_sink(&self) -> EventSink {
            self.sinks.lock().unwrap().last().cloned().unwrap()
        }

        fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RealtimeConnection for FakeTransport {
        async fn connect(
            &self,
            request: ConnectRequest,
            sink: EventSink,
        ) -> Result<(), ConnectionError> {
            assert!(!request.token.is_empty());
            assert_eq!(request.audio.as_ref().map(|a| a.format), Some(FORMAT));
            self.opens.lock().unwrap().push(Instant::now());
            self.sinks.lock().unwrap().push(sink.clone());
            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            match behavior {
                Open::Succeed => {
                    sink.emit(TransportEvent::Opened);
                    Ok(())
                }
                Open::Pending => Ok(()),
                Open::Fail => Err(ConnectionError::Handshake("connection refused".into())),
                Open::Hang => std::future::pending::<Result<(), ConnectionError>>().await,
            }
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tokens() -> Arc<MockTokenSource> {
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_access_token()
            .returning(|| SessionToken::new("evi-session-token".to_string()));
        Arc::new(tokens)
    }

    fn manager_with(
        transport: &Arc<FakeTransport>,
        device: &Arc<FakeDevice>,
        tokens: Arc<MockTokenSource>,
        options: SessionOptions,
    ) -> ConnectionManager {
        ConnectionManager::new(transport.clone(), device.clone(), tokens, options)
    }

    fn manager(transport: &Arc<FakeTransport>, device: &Arc<FakeDevice>) -> ConnectionManager {
        manager_with(transport, device, tokens(), SessionOptions::default())
    }

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    async fn wait_for_acquisitions(device: &FakeDevice, count: usize) {
        while device.acquisitions() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_cancels_timeout() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        manager.connect().await.unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.retry_count, 0);
        assert!(!snapshot.is_connecting);
        assert!(manager.lock().connect_timeout.is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.disconnects(), 0);
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_is_noop() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(device.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_while_in_flight_opens_once() {
        let transport = FakeTransport::always(Open::Pending);
        let device = Arc::new(FakeDevice::default());
        let release = device.gate();
        let manager = manager(&transport, &device);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        wait_for_acquisitions(&device, 1).await;

        for _ in 0..5 {
            manager.connect().await.unwrap();
        }
        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok());

        release.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(device.acquisitions(), 1);
        assert!(manager.snapshot().is_connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_initiated_disconnect_never_retries() {
        let transport = FakeTransport::scripted([Open::Fail], Open::Pending);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        assert!(manager.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.snapshot().retry_count, 1);
        assert!(manager.snapshot().is_connecting);

        transport
            .last_sink()
            .emit(TransportEvent::Closed(DisconnectReason::UserInitiated));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 2);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert!(!snapshot.is_connecting);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_schedules_retry_after_two_seconds() {
        let transport = FakeTransport::always(Open::Pending);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);
        let start = Instant::now();

        manager.connect().await.unwrap();
        transport
            .last_sink()
            .emit(TransportEvent::Closed(DisconnectReason::Closed {
                code: 1011,
                reason: "internal error".into(),
            }));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot.is_connecting);
        assert!(manager.lock().retry_timer.is_some());

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(transport.open_count(), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;

        let offsets = transport.open_offsets(start);
        assert_eq!(offsets.len(), 2);
        assert_near(offsets[1], Duration::from_secs(2));
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_back_off_linearly_then_give_up() {
        let transport = FakeTransport::always(Open::Fail);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);
        let start = Instant::now();

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(ConnectionError::Handshake(_))));
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot.is_connecting);

        tokio::time::sleep(Duration::from_secs(30)).await;

        let offsets = transport.open_offsets(start);
        assert_eq!(offsets.len(), 4);
        assert_near(offsets[0], Duration::ZERO);
        assert_near(offsets[1], Duration::from_secs(2));
        assert_near(offsets[2], Duration::from_secs(6));
        assert_near(offsets[3], Duration::from_secs(12));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.retry_count, 0);
        assert!(!snapshot.is_connecting);
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert!(snapshot.last_error.unwrap().contains("after 3 retries"));
        assert!(manager.lock().retry_timer.is_none());
        // The device is released between attempts and re-acquired for each one.
        assert_eq!(device.acquisitions(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_permission_denied_is_not_retried() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::failing(|| {
            DeviceError::PermissionDenied("blocked by system settings".into())
        }));
        let manager = manager(&transport, &device);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Device(DeviceError::PermissionDenied(_))));

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_connecting);
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some(DeviceError::PermissionDenied(String::new()).user_message())
        );
        {
            let inner = manager.lock();
            assert!(inner.connect_timeout.is_none());
            assert!(inner.retry_timer.is_none());
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 0);
        assert_eq!(device.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_has_its_own_message() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::failing(|| DeviceError::NotFound));
        let manager = manager(&transport, &device);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Device(DeviceError::NotFound)));
        assert_eq!(
            manager.snapshot().last_error.as_deref(),
            Some(DeviceError::NotFound.user_message())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_forces_disconnect() {
        let transport = FakeTransport::always(Open::Hang);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        let _pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(manager.snapshot().is_connecting);
        assert_eq!(transport.disconnects(), 0);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        let snapshot = manager.snapshot();
        assert!(!snapshot.is_connecting);
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.last_error.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(transport.disconnects(), 1);

        // The abandoned attempt can no longer report anything.
        transport.last_sink().emit(TransportEvent::Opened);
        assert_eq!(manager.snapshot().status, ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_discards_superseded_attempt() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let release_first = device.gate();
        let manager = manager(&transport, &device);
        let mut updates = manager.subscribe();

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        wait_for_acquisitions(&device, 1).await;
        let first_epoch = manager.snapshot().epoch;

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.reconnect().await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert!(snapshot.epoch > first_epoch);
        assert_eq!(transport.open_count(), 1);
        updates.borrow_and_update();

        release_first.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(transport.open_count(), 1);
        assert!(!updates.has_changed().unwrap());
        assert_eq!(manager.snapshot(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_stale_sink_are_ignored() {
        let transport = FakeTransport::always(Open::Pending);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        manager.connect().await.unwrap();
        let stale = transport.last_sink();
        manager.reconnect().await.unwrap();
        let live = transport.last_sink();
        assert_ne!(stale.epoch(), live.epoch());

        stale.emit(TransportEvent::Opened);
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connecting);

        live.emit(TransportEvent::Opened);
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connected);

        stale.emit(TransportEvent::Closed(DisconnectReason::Failed("late".into())));
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplied_token_skips_token_source() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let mut tokens = MockTokenSource::new();
        tokens.expect_access_token().times(0);
        let options = SessionOptions {
            access_token: Some(SessionToken::new("supplied".to_string()).unwrap()),
            ..Default::default()
        };
        let manager = manager_with(&transport, &device, Arc::new(tokens), options);

        manager.connect().await.unwrap();
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_is_fatal() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let mut tokens = MockTokenSource::new();
        tokens.expect_access_token().times(1).returning(|| {
            Err(TokenError::Configuration {
                missing: vec!["HUME_API_KEY"],
            })
        });
        let manager =
            manager_with(&transport, &device, Arc::new(tokens), SessionOptions::default());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let snapshot = manager.snapshot();
        assert_eq!(transport.open_count(), 0);
        assert!(!snapshot.is_connecting);
        assert!(snapshot.last_error.unwrap().contains("HUME_API_KEY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_token_failure_is_retried() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let mut tokens = MockTokenSource::new();
        let mut seq = Sequence::new();
        tokens
            .expect_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TokenError::Upstream("503 from token endpoint".into())));
        tokens
            .expect_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| SessionToken::new("second-try".to_string()));
        let manager =
            manager_with(&transport, &device, Arc::new(tokens), SessionOptions::default());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(ConnectionError::Token(_))));
        assert_eq!(manager.snapshot().retry_count, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_connect_is_reported_not_retried() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        manager.connect().await.unwrap();
        transport
            .last_sink()
            .emit(TransportEvent::Closed(DisconnectReason::Closed {
                code: 1006,
                reason: String::new(),
            }));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert!(!snapshot.is_connecting);
        assert!(snapshot.last_error.unwrap().starts_with("Connection lost"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);

        manager.connect().await.unwrap();
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.snapshot().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_hangs_up_without_error() {
        let transport = FakeTransport::always(Open::Succeed);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        manager.connect().await.unwrap();
        manager.disconnect().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(transport.disconnects(), 1);
        assert!(manager.lock().capture.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let transport = FakeTransport::always(Open::Fail);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        assert!(manager.connect().await.is_err());
        assert!(manager.snapshot().is_connecting);

        manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.open_count(), 1);
        assert!(!manager.snapshot().is_connecting);
        assert!(matches!(manager.connect().await, Err(SessionError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_cancels_timers() {
        let transport = FakeTransport::always(Open::Fail);
        let device = Arc::new(FakeDevice::default());
        let manager = manager(&transport, &device);

        assert!(manager.connect().await.is_err());
        drop(manager);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.open_count(), 1);
    }
}
