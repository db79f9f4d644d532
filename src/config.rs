//! # Configuration Management
//!
//! Loads application configuration from layered sources:
//! - Built-in defaults (the Default impl below)
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix (plus bare HOST/PORT used by
//!   deployment platforms)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_AUDIO_BLOCK_SIZE, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values
//!
//! The audio constants deserve care: the remote collaborator expects 16 kHz
//! capture and 24 kHz playback, and the decode path depends on the two rates
//! being different. Validation enforces that asymmetry even when someone makes
//! the rates configurable in deployment.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub remote: RemoteConfig,
}

/// HTTP server settings.
///
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Cadence of state/volume status pushes to the connected client (ms).
    /// The visualizer redraws on this cadence, independent of the audio path.
    pub status_interval_ms: u64,
}

/// Audio pipeline settings.
///
/// ## Block size tradeoff:
/// 4096 samples at 16 kHz is ≈256 ms per capture tick. Smaller blocks reduce
/// latency but increase per-tick overhead and outbound frame count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Microphone capture rate in Hz (the remote expects 16000)
    pub capture_sample_rate: u32,

    /// Synthesized speech playback rate in Hz (the remote produces 24000)
    pub playback_sample_rate: u32,

    /// Samples per capture tick
    pub block_size: usize,

    /// Capture feed queue depth, in blocks. When the queue is full incoming
    /// client batches are dropped rather than blocking the feed.
    pub capture_queue_blocks: usize,
}

/// Remote live-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the live conversational API
    pub endpoint: String,

    /// Name of the environment variable holding the API key
    pub api_key_env: String,

    /// Model identifier for the live session
    pub model: String,

    /// Prebuilt voice used for synthesized speech
    pub voice: String,

    /// System instruction framing the consultation
    pub system_instruction: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                status_interval_ms: 100,
            },
            audio: AudioSettings {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                block_size: 4096,
                capture_queue_blocks: 8,
            },
            remote: RemoteConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key_env: "GEMINI_API_KEY".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "You are an experienced medical consultant. Discuss the differential diagnosis with the user in a professional yet conversational tone. Keep responses concise.".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and APP_* environment
    /// variables, with HOST/PORT handled as deployment-platform overrides.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Beyond the obvious non-zero checks, this enforces the capture/playback
    /// rate asymmetry the decode path depends on.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.status_interval_ms == 0 {
            return Err(anyhow::anyhow!("Status interval must be greater than 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Audio block size must be greater than 0"));
        }

        if self.audio.capture_queue_blocks == 0 {
            return Err(anyhow::anyhow!("Capture queue depth must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_sample_rate == self.audio.playback_sample_rate {
            return Err(anyhow::anyhow!(
                "Capture and playback sample rates must differ (the remote session captures at one rate and synthesizes at another)"
            ));
        }

        if self.remote.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Remote endpoint cannot be empty"));
        }

        if self.remote.model.is_empty() {
            return Err(anyhow::anyhow!("Remote model cannot be empty"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document (runtime config endpoint).
    ///
    /// Only the fields present in the JSON are touched, e.g.
    /// `{"audio": {"block_size": 2048}}` changes just the block size. The
    /// updated configuration is re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
            if let Some(interval) = server.get("status_interval_ms").and_then(|v| v.as_u64()) {
                self.server.status_interval_ms = interval;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = audio.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.capture_sample_rate = rate as u32;
            }
            if let Some(rate) = audio.get("playback_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.playback_sample_rate = rate as u32;
            }
            if let Some(size) = audio.get("block_size").and_then(|v| v.as_u64()) {
                self.audio.block_size = size as usize;
            }
            if let Some(depth) = audio.get("capture_queue_blocks").and_then(|v| v.as_u64()) {
                self.audio.capture_queue_blocks = depth as usize;
            }
        }

        if let Some(remote) = partial.get("remote") {
            if let Some(endpoint) = remote.get("endpoint").and_then(|v| v.as_str()) {
                self.remote.endpoint = endpoint.to_string();
            }
            if let Some(model) = remote.get("model").and_then(|v| v.as_str()) {
                self.remote.model = model.to_string();
            }
            if let Some(voice) = remote.get("voice").and_then(|v| v.as_str()) {
                self.remote.voice = voice.to_string();
            }
            if let Some(instruction) = remote.get("system_instruction").and_then(|v| v.as_str()) {
                self.remote.system_instruction = instruction.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.block_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_port_zero() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_equal_sample_rates() {
        let mut config = AppConfig::default();
        config.audio.playback_sample_rate = config.audio.capture_sample_rate;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_block_size() {
        let mut config = AppConfig::default();
        config.audio.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_update_touches_only_named_fields() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"block_size": 2048}, "remote": {"voice": "Puck"}}"#;
        assert!(config.update_from_json(json).is_ok());

        assert_eq!(config.audio.block_size, 2048);
        assert_eq!(config.remote.voice, "Puck");
        // Untouched fields keep their values
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_update_rejecting_invalid_result_leaves_error() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"playback_sample_rate": 16000}}"#;
        // Equalizing the rates fails validation
        assert!(config.update_from_json(json).is_err());
    }
}
