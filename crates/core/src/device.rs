//! Local audio input capability.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors raised while acquiring the microphone. These are fatal for the
/// attempt and are never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no audio input device found")]
    NotFound,
    #[error("audio input device unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    /// A message suitable for showing to the end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied(_) => {
                "Microphone access was denied. Allow microphone access and try again."
            }
            DeviceError::NotFound => "No microphone was found. Connect a microphone and try again.",
            DeviceError::Unavailable(_) => {
                "The microphone is busy or unavailable. Close other apps using it and try again."
            }
        }
    }
}

/// PCM format of captured audio after downmixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Captured little-endian PCM16 chunks, plus the format they are in.
#[derive(Debug)]
pub struct AudioStream {
    pub format: AudioFormat,
    pub frames: mpsc::Receiver<Vec<i16>>,
}

/// An open microphone. The device stays acquired until this is dropped.
pub trait AudioCapture: Send {
    /// Hands out the sample stream. Returns `None` once it has been taken.
    fn take_stream(&mut self) -> Option<AudioStream>;
}

/// Acquires the local audio input device.
#[async_trait]
pub trait AudioInput: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn AudioCapture>, DeviceError>;
}
