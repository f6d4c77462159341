//! Messages exchanged on the EVI chat socket.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages we send to EVI.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announces the format of the audio that follows.
    SessionSettings { audio: AudioSettings },
    /// A base64 chunk of linear16 audio.
    AudioInput { data: String },
    /// Text the user typed instead of speaking.
    UserInput { text: String },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSettings {
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate,
            channels,
        }
    }
}

/// Messages EVI sends to us. Anything unrecognised lands in `Unknown`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ChatMetadata {
        chat_id: String,
        #[serde(default)]
        chat_group_id: Option<String>,
    },
    UserMessage {
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
        #[serde(default)]
        interim: bool,
    },
    AssistantMessage {
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
    },
    AudioOutput {
        data: String,
    },
    AssistantEnd,
    UserInterruption,
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
        #[serde(default)]
        slug: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Inference {
    #[serde(default)]
    pub prosody: Option<ProsodyInference>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProsodyInference {
    #[serde(default)]
    pub scores: HashMap<String, f64>,
}

impl Inference {
    /// The `n` highest-scoring emotions, strongest first.
    pub fn top_emotions(&self, n: usize) -> Vec<(String, f64)> {
        let Some(prosody) = &self.prosody else {
            return Vec::new();
        };
        let mut scores: Vec<(String, f64)> = prosody
            .scores
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores.truncate(n);
        scores
    }
}
