//! Speaker output for the assistant's voice.
//!
//! Decoded `audio_output` fragments are downmixed, resampled to the output
//! device rate and queued. The device callback drains the queue and pads with
//! silence. An interruption empties the queue so the coach stops talking
//! over the user.

use crate::audio::{build_error, config_error, play_error};
use cpal::{
    SampleFormat,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use hume_evi::audio::{PcmChunk, convert_i16_to_f32, decode_audio_output, downmix_to_mono};
use pivots_core::device::DeviceError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc as std_mpsc},
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const RESAMPLER_CHUNK: usize = 1024;

type Queue = Arc<Mutex<VecDeque<f32>>>;

fn lock(queue: &Mutex<VecDeque<f32>>) -> MutexGuard<'_, VecDeque<f32>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feeds a fixed-input resampler from fragments of any length, holding back
/// the remainder until a full chunk is available.
struct ChunkResampler {
    source_rate: u32,
    inner: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl ChunkResampler {
    fn new(source_rate: u32, target_rate: u32) -> Result<Self, rubato::ResamplerConstructionError> {
        let inner = FastFixedIn::<f32>::new(
            f64::from(target_rate) / f64::from(source_rate),
            1.0,
            PolynomialDegree::Cubic,
            RESAMPLER_CHUNK,
            1,
        )?;
        Ok(Self {
            source_rate,
            inner,
            pending: Vec::new(),
        })
    }

    fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut resampled = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match self.inner.process(&[chunk], None) {
                Ok(mut out) => {
                    if let Some(channel) = out.first_mut() {
                        resampled.append(channel);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "resampling failed; dropping audio");
                    break;
                }
            }
        }
        resampled
    }

    /// Resamples whatever is held back, zero-padding the last chunk.
    fn flush(&mut self) -> Vec<f32> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let tail = [std::mem::take(&mut self.pending)];
        match self.inner.process_partial(Some(&tail[..]), None) {
            Ok(mut out) => out.first_mut().map(std::mem::take).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "resampling failed; dropping audio");
                Vec::new()
            }
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.inner.reset();
    }
}

/// Turns decoded fragments into mono samples at the device rate.
pub struct Playback {
    queue: Queue,
    device_rate: u32,
    resampler: Option<ChunkResampler>,
}

impl Playback {
    fn new(queue: Queue, device_rate: u32) -> Self {
        Self {
            queue,
            device_rate,
            resampler: None,
        }
    }

    /// Queues a fragment. Headerless fragments are assumed to already be at
    /// the device rate.
    pub fn enqueue(&mut self, chunk: PcmChunk) {
        if chunk.samples.is_empty() {
            return;
        }
        let samples = convert_i16_to_f32(&downmix_to_mono(&chunk.samples, chunk.channels));
        let source_rate = chunk.sample_rate.unwrap_or(self.device_rate);
        let samples = if source_rate == self.device_rate {
            samples
        } else {
            match self.resampler_for(source_rate) {
                Some(resampler) => resampler.push(&samples),
                None => return,
            }
        };
        lock(&self.queue).extend(samples);
    }

    /// Plays out the samples still held by the resampler.
    pub fn finish(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            let tail = resampler.flush();
            lock(&self.queue).extend(tail);
        }
    }

    /// Drops everything not yet played.
    pub fn interrupt(&mut self) {
        let dropped = {
            let mut queue = lock(&self.queue);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        debug!(dropped, "playback interrupted");
    }

    fn resampler_for(&mut self, source_rate: u32) -> Option<&mut ChunkResampler> {
        if self.resampler.as_ref().map(|r| r.source_rate) != Some(source_rate) {
            self.resampler = match ChunkResampler::new(source_rate, self.device_rate) {
                Ok(resampler) => Some(resampler),
                Err(e) => {
                    warn!(error = %e, source_rate, "cannot resample assistant audio");
                    None
                }
            };
        }
        self.resampler.as_mut()
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<f32> {
        lock(&self.queue).iter().copied().collect()
    }
}

/// Writes queued mono samples to every channel of `out`, padding with silence.
fn fill(queue: &Mutex<VecDeque<f32>>, out: &mut [f32], channels: usize) {
    let mut queue = lock(queue);
    for frame in out.chunks_mut(channels.max(1)) {
        let sample = queue.pop_front().unwrap_or(0.0);
        frame.fill(sample);
    }
}

/// The default output device. Dropping it hangs up the stop channel, which
/// lets the output thread drop the stream.
pub struct Speaker {
    playback: Playback,
    _stop: std_mpsc::Sender<()>,
}

impl Speaker {
    pub async fn open() -> Result<Self, DeviceError> {
        let queue: Queue = Arc::default();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let output_queue = queue.clone();
        std::thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || run_output(output_queue, ready_tx, stop_rx))
            .map_err(|e| {
                DeviceError::Unavailable(format!("failed to start output thread: {}", e))
            })?;

        let device_rate = ready_rx
            .await
            .map_err(|_| DeviceError::Unavailable("output thread exited".to_string()))??;
        info!(device_rate, "speaker opened");

        Ok(Self {
            playback: Playback::new(queue, device_rate),
            _stop: stop_tx,
        })
    }

    /// Decodes and queues one `audio_output` payload.
    pub fn play(&mut self, data: &str) {
        self.playback.enqueue(decode_audio_output(data));
    }

    pub fn finish(&mut self) {
        self.playback.finish();
    }

    pub fn interrupt(&mut self) {
        self.playback.interrupt();
    }
}

fn run_output(
    queue: Queue,
    ready: oneshot::Sender<Result<u32, DeviceError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (stream, rate) = match open_stream(queue) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(rate)).is_err() {
        return;
    }
    let _ = stop.recv();
    drop(stream);
    debug!("speaker released");
}

fn open_stream(queue: Queue) -> Result<(cpal::Stream, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(DeviceError::NotFound)?;
    let supported = device.default_output_config().map_err(config_error)?;

    let channels = usize::from(supported.channels());
    let sample_format = supported.sample_format();
    let rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();
    debug!(channels, ?sample_format, sample_rate = rate, "opening output stream");

    let on_error = |e: cpal::StreamError| warn!(error = %e, "speaker stream error");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill(&queue, data, channels),
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    fill(&queue, &mut scratch, channels);
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = (sample * i16::MAX as f32) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    }
    .map_err(build_error)?;

    stream.play().map_err(play_error)?;
    Ok((stream, rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn playback(device_rate: u32) -> Playback {
        Playback::new(Arc::default(), device_rate)
    }

    fn chunk(sample_rate: Option<u32>, channels: u16, samples: Vec<i16>) -> PcmChunk {
        PcmChunk {
            sample_rate,
            channels,
            samples,
        }
    }

    #[test]
    fn test_same_rate_fragment_is_queued_as_is() {
        let mut playback = playback(48_000);
        playback.enqueue(chunk(Some(48_000), 1, vec![16384, -16384, 0]));
        assert_eq!(playback.queued(), vec![0.5, -0.5, 0.0]);
        assert!(playback.resampler.is_none());
    }

    #[test]
    fn test_headerless_fragment_plays_at_device_rate() {
        let mut playback = playback(44_100);
        playback.enqueue(chunk(None, 1, vec![8192; 10]));
        assert_eq!(playback.queued().len(), 10);
        assert!(playback.resampler.is_none());
    }

    #[test]
    fn test_stereo_fragment_is_downmixed() {
        let mut playback = playback(24_000);
        playback.enqueue(chunk(Some(24_000), 2, vec![16384, 0, -16384, -16384]));
        let queued = playback.queued();
        assert_eq!(queued.len(), 2);
        assert_relative_eq!(queued[0], 0.25);
        assert_relative_eq!(queued[1], -0.5);
    }

    #[test]
    fn test_lower_rate_fragment_is_upsampled() {
        let mut playback = playback(48_000);
        playback.enqueue(chunk(Some(24_000), 1, vec![1000; 4 * RESAMPLER_CHUNK]));
        let queued = playback.queued().len();
        assert!(
            (7 * RESAMPLER_CHUNK..=9 * RESAMPLER_CHUNK).contains(&queued),
            "queued {} samples",
            queued
        );
    }

    #[test]
    fn test_finish_flushes_held_back_samples() {
        let mut playback = playback(48_000);
        playback.enqueue(chunk(Some(24_000), 1, vec![1000; 100]));
        assert!(playback.queued().is_empty());

        playback.finish();
        assert!(!playback.queued().is_empty());

        let before = playback.queued().len();
        playback.finish();
        assert_eq!(playback.queued().len(), before);
    }

    #[test]
    fn test_interrupt_drops_unplayed_audio() {
        let mut playback = playback(48_000);
        playback.enqueue(chunk(Some(48_000), 1, vec![1000; 256]));
        playback.enqueue(chunk(Some(24_000), 1, vec![1000; 100]));
        playback.interrupt();
        assert!(playback.queued().is_empty());

        playback.finish();
        assert!(playback.queued().is_empty());
    }

    #[test]
    fn test_empty_fragment_is_ignored() {
        let mut playback = playback(48_000);
        playback.enqueue(PcmChunk::default());
        assert!(playback.queued().is_empty());
    }

    #[test]
    fn test_fill_copies_to_all_channels_and_pads_silence() {
        let queue = Mutex::new(VecDeque::from(vec![0.1, 0.2]));
        let mut out = [1.0_f32; 6];
        fill(&queue, &mut out, 2);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.0, 0.0]);
        assert!(lock(&queue).is_empty());
    }
}
