//! PCM helpers for the chat socket: encoding microphone audio for
//! `audio_input` and decoding the assistant's `audio_output`.

use base64::Engine;
use tracing::{error, warn};

/// Converts normalized f32 samples to i16, clamping out-of-range values.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Averages interleaved frames down to a single channel.
pub fn downmix_to_mono(interleaved: &[i16], channels: u16) -> Vec<i16> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Encodes i16 samples as base64 little-endian PCM16.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|&s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Converts i16 samples to normalized f32.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// One decoded `audio_output` fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmChunk {
    /// `None` when the fragment was headerless PCM.
    pub sample_rate: Option<u32>,
    pub channels: u16,
    pub samples: Vec<i16>,
}

/// Decodes an `audio_output` payload. EVI sends base64 WAV; headerless
/// little-endian PCM16 is accepted too.
pub fn decode_audio_output(data: &str) -> PcmChunk {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to decode base64 audio fragment");
            return PcmChunk::default();
        }
    };
    parse_wav(&bytes).unwrap_or_else(|| PcmChunk {
        sample_rate: None,
        channels: 1,
        samples: pcm_from_le_bytes(&bytes),
    })
}

fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

fn parse_wav(bytes: &[u8]) -> Option<PcmChunk> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut format = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().ok()?) as usize;
        let start = offset + 8;
        // Streamed WAVs may declare a size larger than what was sent.
        let end = start.saturating_add(size).min(bytes.len());
        let body = &bytes[start..end];
        match id {
            b"fmt " if body.len() >= 16 => {
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                if bits != 16 {
                    warn!(bits, "unsupported WAV sample width");
                    return Some(PcmChunk::default());
                }
                format = Some((sample_rate, channels.max(1)));
            }
            b"data" => {
                let (sample_rate, channels) = format?;
                return Some(PcmChunk {
                    sample_rate: Some(sample_rate),
                    channels,
                    samples: pcm_from_le_bytes(body),
                });
            }
            _ => {}
        }
        offset = end + (size & 1);
    }
    None
}
