//! # Live Consultation Audio Core
//!
//! The real-time audio pipeline of the consultation:
//!
//! microphone → capture loop → codec (encode) → outbound frame → remote session
//! → inbound frame → codec (decode) → playback scheduler → speaker
//!
//! ## Components:
//! - **codec**: pure frame conversion (f32 samples ↔ base64 PCM16 LE)
//! - **volume**: RMS loudness metering tapping the capture path for the visualizer
//! - **playback**: gapless back-to-back scheduling onto the output device
//! - **capture**: the per-tick background loop feeding codec, volume and send path
//!
//! ## Format constants (defaults, configurable):
//! - Capture: 16 kHz mono, 4096-sample blocks (≈256 ms per tick)
//! - Playback: 24 kHz mono (the capture/playback asymmetry is contractual;
//!   decode depends on it)

pub mod capture;
pub mod codec;
pub mod playback;
pub mod volume;
