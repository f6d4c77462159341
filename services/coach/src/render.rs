//! Terminal rendering for the coach shell.

use hume_evi::types::{Inference, ServerMessage};
use pivots_core::{
    DeviceError, SessionError, SessionSnapshot,
    manager::ConnectionStatus,
    presentation::{Affordance, Visibility, affordance},
};

const EMOTIONS_SHOWN: usize = 3;

pub fn status_line(snapshot: &SessionSnapshot) -> String {
    match affordance(snapshot, Visibility::Visible) {
        Affordance::CallToAction { label } => format!("[ {} ]  press Enter to start a call", label),
        Affordance::Busy { label, .. } => format!("... {}", label),
        Affordance::Hidden if snapshot.status == ConnectionStatus::Connected => {
            "* connected. Speak now, or type h to hang up".to_string()
        }
        Affordance::Hidden => String::new(),
    }
}

pub fn snapshot(snapshot: &SessionSnapshot) {
    if let Some(error) = &snapshot.last_error {
        println!("! {}", error);
    }
    let line = status_line(snapshot);
    if !line.is_empty() {
        println!("{}", line);
    }
}

pub fn emotions(models: &Inference) -> String {
    models
        .top_emotions(EMOTIONS_SHOWN)
        .iter()
        .map(|(name, score)| format!("{} {:.2}", name, score))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The line to print for a chat message, if it is worth printing.
pub fn chat_line(message: &ServerMessage) -> Option<String> {
    match message {
        ServerMessage::UserMessage {
            message,
            models,
            interim: false,
        } => {
            let text = message.content.as_deref()?;
            let emotions = emotions(models);
            if emotions.is_empty() {
                Some(format!("you:   {}", text))
            } else {
                Some(format!("you:   {}  ({})", text, emotions))
            }
        }
        ServerMessage::AssistantMessage { message, .. } => {
            message.content.as_deref().map(|text| format!("coach: {}", text))
        }
        ServerMessage::UserInterruption => Some("coach: (interrupted)".to_string()),
        ServerMessage::Error { message, .. } => Some(format!("! voice service error: {}", message)),
        _ => None,
    }
}

pub fn message(message: &ServerMessage) {
    if let Some(line) = chat_line(message) {
        println!("{}", line);
    }
}

pub fn session_error(error: &SessionError) {
    match error {
        SessionError::Device(device) => device_error(device),
        other => println!("! {}", other),
    }
}

fn device_error(error: &DeviceError) {
    println!("! {}", error.user_message());
}

pub fn help() {
    println!("commands: Enter or c = call, r = reconnect, h = hang up, q = quit");
}
