//! Terminal voice coach.
//!
//! Drives a [`ConnectionManager`] from keyboard commands, captures the
//! microphone with `cpal`, plays the coach's voice and prints the
//! conversation as it happens. Logs go
//! to stderr so they do not interleave with the transcript on stdout.

mod audio;
mod command;
mod config;
mod playback;
mod render;

use anyhow::Context;
use clap::Parser;
use command::Command;
use config::Config;
use hume_evi::{
    EndpointTokenSource, EviConfig, EviConnection, TokenProvider, types::ServerMessage,
};
use pivots_core::{ConnectionManager, SessionOptions, TokenSource};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Practice interviews with the Deep Pivots voice coach")]
struct Args {
    /// Token-issuance endpoint to fetch session tokens from.
    #[arg(long)]
    token_url: Option<String>,

    /// Exchange HUME_API_KEY/HUME_SECRET_KEY for tokens directly instead of
    /// asking the token endpoint.
    #[arg(long)]
    direct: bool,

    /// EVI chat socket URL.
    #[arg(long)]
    evi_url: Option<String>,

    /// EVI configuration to talk to.
    #[arg(long)]
    config_id: Option<String>,

    #[arg(long)]
    connect_timeout_secs: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.token_url {
            config.token_endpoint = url;
        }
        if let Some(url) = self.evi_url {
            config.chat_url = url;
        }
        if let Some(id) = self.config_id {
            config.hume_config_id = Some(id);
        }
        if let Some(secs) = self.connect_timeout_secs.filter(|s| *s > 0) {
            config.connect_timeout = Duration::from_secs(secs);
        }
    }
}

fn spawn_attempt(manager: ConnectionManager, command: Command) {
    tokio::spawn(async move {
        let result = match command {
            Command::Reconnect => manager.reconnect().await,
            _ => manager.connect().await,
        };
        if let Err(e) = result {
            error!(error = %e, "connection attempt failed");
            render::session_error(&e);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,pivots_core=info,hume_evi=info")),
        )
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let args = Args::parse();
    let direct = args.direct;
    let mut config = Config::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);

    let tokens: Arc<dyn TokenSource> = if direct {
        info!("exchanging credentials for session tokens directly");
        Arc::new(TokenProvider::with_token_url(
            config.credentials(),
            config.oauth_token_url.clone(),
        ))
    } else {
        info!(endpoint = %config.token_endpoint, "fetching session tokens from endpoint");
        Arc::new(EndpointTokenSource::new(config.token_endpoint.clone()))
    };

    let (messages_tx, mut messages) = mpsc::unbounded_channel();
    let transport = Arc::new(EviConnection::new(
        EviConfig {
            chat_url: config.chat_url.clone(),
            config_id: config.hume_config_id.clone(),
        },
        messages_tx,
    ));
    let manager = ConnectionManager::new(
        transport,
        Arc::new(audio::CpalInput::default()),
        tokens,
        SessionOptions {
            connect_timeout: config.connect_timeout,
            ..SessionOptions::default()
        },
    );

    let mut speaker = match playback::Speaker::open().await {
        Ok(speaker) => Some(speaker),
        Err(e) => {
            warn!(error = %e, "no audio output; the coach will only be shown as text");
            None
        }
    };

    let mut snapshots = manager.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    render::help();
    render::snapshot(&manager.snapshot());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::HangUp) => {
                        manager.disconnect().await;
                        if let Some(speaker) = speaker.as_mut() {
                            speaker.interrupt();
                        }
                    }
                    Some(command) => spawn_attempt(manager.clone(), command),
                    None => render::help(),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render::snapshot(&snapshot);
            }
            Some(message) = messages.recv() => {
                if let Some(speaker) = speaker.as_mut() {
                    match &message {
                        ServerMessage::AudioOutput { data } => speaker.play(data),
                        ServerMessage::AssistantEnd => speaker.finish(),
                        ServerMessage::UserInterruption => speaker.interrupt(),
                        _ => {}
                    }
                }
                render::message(&message);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
