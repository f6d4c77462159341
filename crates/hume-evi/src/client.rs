//! The EVI chat socket as a [`RealtimeConnection`].

use crate::{
    DEFAULT_CHAT_URL, audio,
    types::{AudioSettings, ClientMessage, ServerMessage},
};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use pivots_core::{
    device::{AudioFormat, AudioStream},
    token::SessionToken,
    transport::{
        ConnectRequest, ConnectionError, DisconnectReason, EventSink, RealtimeConnection,
        TransportEvent,
    },
};
use reqwest::Url;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to open the chat socket.
#[derive(Debug, Clone)]
pub struct EviConfig {
    pub chat_url: String,
    pub config_id: Option<String>,
}

impl Default for EviConfig {
    fn default() -> Self {
        Self {
            chat_url: DEFAULT_CHAT_URL.to_string(),
            config_id: None,
        }
    }
}

impl EviConfig {
    /// Builds the authenticated chat URL. The result embeds the token and must
    /// never be logged.
    pub fn chat_url(&self, token: &SessionToken) -> Result<Url, ConnectionError> {
        let mut params = vec![("access_token", token.expose())];
        if let Some(config_id) = &self.config_id {
            params.push(("config_id", config_id.as_str()));
        }
        Url::parse_with_params(&self.chat_url, &params)
            .map_err(|e| ConnectionError::Request(format!("invalid chat url: {}", e)))
    }
}

struct ActiveChat {
    epoch: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One EVI chat socket at a time. Incoming chat traffic is forwarded to the
/// channel given at construction; lifecycle changes go to the attempt's sink.
pub struct EviConnection {
    config: EviConfig,
    messages: mpsc::UnboundedSender<ServerMessage>,
    active: Mutex<Option<ActiveChat>>,
}

impl EviConnection {
    pub fn new(config: EviConfig, messages: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            config,
            messages,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RealtimeConnection for EviConnection {
    async fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        let url = self.config.chat_url(&request.token)?;
        let (mut socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let mut active = self.active.lock().await;
        if !sink.is_current() {
            debug!(epoch = sink.epoch(), "closing socket opened for superseded attempt");
            let _ = socket.close(None).await;
            return Err(ConnectionError::Superseded);
        }

        if let Some(format) = request.audio.as_ref().map(|a| a.format) {
            let settings = session_settings(format);
            send_json(&mut socket, &settings)
                .await
                .map_err(|e| ConnectionError::Handshake(format!("session settings: {}", e)))?;
        }

        if let Some(previous) = active.take() {
            warn!(epoch = previous.epoch, "replacing a chat socket that was still open");
            previous.task.abort();
        }

        info!(epoch = sink.epoch(), "connected to EVI chat");
        sink.emit(TransportEvent::Opened);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (socket_tx, socket_rx) = socket.split();
        let task = tokio::spawn(pump(
            socket_tx,
            socket_rx,
            request.audio,
            stop_rx,
            sink.clone(),
            self.messages.clone(),
        ));
        *active = Some(ActiveChat {
            epoch: sink.epoch(),
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(chat) = self.active.lock().await.take() else {
            return;
        };
        debug!(epoch = chat.epoch, "closing EVI chat");
        let _ = chat.stop.send(());
        if let Err(e) = chat.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "chat task failed while closing");
            }
        }
    }
}

fn session_settings(format: AudioFormat) -> ClientMessage {
    ClientMessage::SessionSettings {
        audio: AudioSettings::linear16(format.sample_rate, format.channels),
    }
}

async fn send_json<S>(sink: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Shuttles microphone audio out and chat messages in until either side ends.
async fn pump(
    mut socket_tx: SplitSink<Socket, WsMessage>,
    mut socket_rx: SplitStream<Socket>,
    audio: Option<AudioStream>,
    mut stop: oneshot::Receiver<()>,
    sink: EventSink,
    messages: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut audio_open = audio.is_some();
    let mut frames = match audio {
        Some(stream) => stream.frames,
        None => mpsc::channel(1).1,
    };

    let reason = loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = socket_tx.send(WsMessage::Close(None)).await;
                break DisconnectReason::UserInitiated;
            }
            chunk = frames.recv(), if audio_open => match chunk {
                Some(samples) => {
                    let message = ClientMessage::AudioInput { data: audio::encode_i16(&samples) };
                    if let Err(e) = send_json(&mut socket_tx, &message).await {
                        break DisconnectReason::Failed(format!("failed to send audio: {}", e));
                    }
                }
                None => {
                    warn!("audio input stream ended");
                    audio_open = false;
                }
            },
            incoming = socket_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Error { code, message, slug }) => {
                            warn!(?code, ?slug, %message, "EVI reported an error");
                            let _ = messages.send(ServerMessage::Error { code, message, slug });
                        }
                        Ok(message) => {
                            let _ = messages.send(message);
                        }
                        Err(e) => debug!(error = %e, "ignoring unparseable chat message"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    break DisconnectReason::Closed { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break DisconnectReason::Failed(e.to_string()),
                None => {
                    break DisconnectReason::Closed {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    };
                }
            },
        }
    };

    info!(epoch = sink.epoch(), %reason, "EVI chat closed");
    sink.emit(TransportEvent::Closed(reason));
}
