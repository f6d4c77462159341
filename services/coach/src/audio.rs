//! Microphone capture through `cpal`.
//!
//! `cpal::Stream` is not `Send`, so each capture owns a dedicated thread that
//! builds the stream, reports the negotiated format and then parks until the
//! capture handle is dropped.

use async_trait::async_trait;
use cpal::{
    BuildStreamError, DefaultStreamConfigError, PlayStreamError, SampleFormat,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use hume_evi::audio::{convert_f32_to_i16, downmix_to_mono};
use pivots_core::device::{AudioCapture, AudioFormat, AudioInput, AudioStream, DeviceError};
use std::sync::mpsc as std_mpsc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const FRAME_BUFFER: usize = 64;

/// The default input device of the default host.
pub struct CpalInput {
    buffer: usize,
}

impl Default for CpalInput {
    fn default() -> Self {
        Self {
            buffer: FRAME_BUFFER,
        }
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn acquire(&self) -> Result<Box<dyn AudioCapture>, DeviceError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (frames_tx, frames_rx) = mpsc::channel(self.buffer);

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture(frames_tx, ready_tx, stop_rx))
            .map_err(|e| {
                DeviceError::Unavailable(format!("failed to start capture thread: {}", e))
            })?;

        let format = ready_rx
            .await
            .map_err(|_| DeviceError::Unavailable("capture thread exited".to_string()))??;
        info!(sample_rate = format.sample_rate, "microphone acquired");

        Ok(Box::new(CpalCapture {
            stream: Some(AudioStream {
                format,
                frames: frames_rx,
            }),
            _stop: stop_tx,
        }))
    }
}

/// Holds the microphone open. Dropping it hangs up the stop channel, which
/// lets the capture thread drop the stream.
struct CpalCapture {
    stream: Option<AudioStream>,
    _stop: std_mpsc::Sender<()>,
}

impl AudioCapture for CpalCapture {
    fn take_stream(&mut self) -> Option<AudioStream> {
        self.stream.take()
    }
}

fn run_capture(
    frames: mpsc::Sender<Vec<i16>>,
    ready: oneshot::Sender<Result<AudioFormat, DeviceError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (stream, format) = match open_stream(frames) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(format)).is_err() {
        return;
    }
    // Returns once the sender is dropped.
    let _ = stop.recv();
    drop(stream);
    debug!("microphone released");
}

fn open_stream(
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<(cpal::Stream, AudioFormat), DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NotFound)?;
    let supported = device.default_input_config().map_err(config_error)?;

    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let format = AudioFormat {
        sample_rate: supported.sample_rate().0,
        channels: 1,
    };
    let config: cpal::StreamConfig = supported.into();
    debug!(channels, ?sample_format, sample_rate = format.sample_rate, "opening input stream");

    let on_error = |e: cpal::StreamError| warn!(error = %e, "microphone stream error");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward(&frames, downmix_to_mono(&convert_f32_to_i16(data), channels))
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                forward(&frames, downmix_to_mono(data, channels))
            },
            on_error,
            None,
        ),
        other => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    }
    .map_err(build_error)?;

    stream.play().map_err(play_error)?;
    Ok((stream, format))
}

fn forward(frames: &mpsc::Sender<Vec<i16>>, samples: Vec<i16>) {
    if let Err(mpsc::error::TrySendError::Full(_)) = frames.try_send(samples) {
        trace!("audio consumer is behind; dropping a chunk");
    }
}

/// Backends report permission problems only as text.
fn backend_error(description: String) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        DeviceError::PermissionDenied(description)
    } else {
        DeviceError::Unavailable(description)
    }
}

pub(crate) fn config_error(e: DefaultStreamConfigError) -> DeviceError {
    match e {
        DefaultStreamConfigError::DeviceNotAvailable => DeviceError::NotFound,
        DefaultStreamConfigError::BackendSpecific { err } => backend_error(err.description),
        other => DeviceError::Unavailable(other.to_string()),
    }
}

pub(crate) fn build_error(e: BuildStreamError) -> DeviceError {
    match e {
        BuildStreamError::DeviceNotAvailable => DeviceError::NotFound,
        BuildStreamError::BackendSpecific { err } => backend_error(err.description),
        other => DeviceError::Unavailable(other.to_string()),
    }
}

pub(crate) fn play_error(e: PlayStreamError) -> DeviceError {
    match e {
        PlayStreamError::DeviceNotAvailable => DeviceError::NotFound,
        PlayStreamError::BackendSpecific { err } => backend_error(err.description),
    }
}
