//! # Audio Frame Codec
//!
//! Pure conversion functions between captured floating-point audio blocks and the
//! transport frame format exchanged with the remote live session: signed 16-bit
//! little-endian PCM, base64-encoded, tagged with its sample rate.
//!
//! ## Key Functions:
//! - **encode_block**: CaptureBlock (f32 samples) → OutboundFrame (base64 PCM16 LE)
//! - **decode_frame**: InboundFrame (base64 PCM16 LE) → DecodedChunk (f32 samples + duration)
//!
//! Encoding never fails: out-of-range samples are clamped to [-1.0, 1.0] before
//! quantization. Decoding fails only on malformed payloads (bad base64 or an odd
//! byte count); the caller drops the frame and keeps the session alive.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// One block of captured microphone samples, normalized to roughly [-1.0, 1.0].
/// Produced and consumed within a single capture tick.
pub type CaptureBlock = Vec<f32>;

/// Transport-encoded representation of one capture block.
///
/// Immutable once constructed; owned by the send path until it is handed to the
/// remote session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutboundFrame {
    /// Base64-encoded signed 16-bit little-endian PCM payload
    pub data: String,

    /// Sample rate the payload was captured at (Hz)
    pub sample_rate: u32,
}

/// Base64-encoded PCM payload received from the remote session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InboundFrame {
    /// Base64-encoded signed 16-bit little-endian PCM payload
    pub data: String,

    /// Sample rate the payload should be played back at (Hz)
    pub sample_rate: u32,
}

/// A decoded, directly playable buffer of audio samples.
///
/// Owned by the playback scheduler from decode until its scheduled playback
/// completes, after which it is discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// Normalized samples at the playback rate
    pub samples: Vec<f32>,

    /// Sample rate of the samples (Hz)
    pub sample_rate: u32,

    /// Playable duration in seconds (`samples.len() / sample_rate`)
    pub duration: f64,
}

/// Errors produced while decoding an inbound frame.
///
/// ## Recovery policy:
/// A decode error means one malformed frame, not a broken session. The frame
/// handler logs it, drops the frame, and the session stays Connected.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// Payload was not valid base64
    InvalidBase64(String),

    /// Decoded byte count is not a multiple of 2, so it cannot be 16-bit PCM
    OddByteLength(usize),

    /// Frame declared a zero sample rate, so no duration can be computed
    ZeroSampleRate,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidBase64(msg) => write!(f, "invalid base64 payload: {}", msg),
            DecodeError::OddByteLength(len) => {
                write!(f, "payload length {} is not a multiple of 2", len)
            }
            DecodeError::ZeroSampleRate => write!(f, "frame declared a sample rate of 0"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a block of captured samples into a transport frame.
///
/// ## Conversion:
/// Each sample is clamped to [-1.0, 1.0], scaled to the signed 16-bit range,
/// serialized little-endian, and base64-encoded. Deterministic, no side effects,
/// and it never fails: out-of-range input is clamped, not rejected.
pub fn encode_block(block: &[f32], sample_rate: u32) -> OutboundFrame {
    let mut bytes = vec![0u8; block.len() * 2];
    for (i, &sample) in block.iter().enumerate() {
        let clamped = sample.clamp(-1.0, 1.0);
        let quantized = (clamped * 32767.0).round() as i16;
        LittleEndian::write_i16(&mut bytes[i * 2..i * 2 + 2], quantized);
    }

    OutboundFrame {
        data: BASE64.encode(&bytes),
        sample_rate,
    }
}

/// Decode an inbound frame into a playable chunk.
///
/// ## Conversion:
/// Base64-decodes the payload, reinterprets the bytes as little-endian 16-bit
/// signed integers, rescales to [-1.0, 1.0] floats, and computes the chunk
/// duration from the declared sample rate.
///
/// ## Errors:
/// - `DecodeError::InvalidBase64` if the payload is not valid base64
/// - `DecodeError::OddByteLength` if the byte count is not a multiple of 2
/// - `DecodeError::ZeroSampleRate` if the declared rate is 0
pub fn decode_frame(frame: &InboundFrame) -> Result<DecodedChunk, DecodeError> {
    if frame.sample_rate == 0 {
        return Err(DecodeError::ZeroSampleRate);
    }

    let bytes = BASE64
        .decode(&frame.data)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    let samples = samples_from_pcm16(&bytes)?;
    let duration = samples.len() as f64 / frame.sample_rate as f64;

    Ok(DecodedChunk {
        samples,
        sample_rate: frame.sample_rate,
        duration,
    })
}

/// Reinterpret raw little-endian 16-bit PCM bytes as normalized f32 samples.
///
/// Shared by the frame decoder and the WebSocket bridge, which receives the
/// client's microphone audio as raw binary rather than base64.
pub fn samples_from_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }

    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let value = LittleEndian::read_i16(pair);
        // Same scale factor as the encoder, so the rails map back to exactly
        // +/-1.0; i16::MIN lands just below the range and is clamped
        samples.push((value as f32 / 32767.0).clamp(-1.0, 1.0));
    }

    Ok(samples)
}
