//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` / `OPENAI_API_KEY` (deployment platform conventions)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_VOICE__SILENCE_TIMEOUT_SECS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore so snake_case field names survive the mapping.

use crate::audio::buffer::AudioBufferConfig;
use crate::audio::segmenter::SegmenterConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub voice: VoiceConfig,
    pub providers: ProvidersConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Format of the PCM stream clients send over the voice socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Real-time conversation tuning.
///
/// ## Segmentation:
/// `vad_threshold`, `silence_timeout_secs`, `min_speech_duration_secs` and
/// `max_speech_duration_secs` are clamped into their allowed ranges on load.
///
/// ## Recognition windows:
/// A partial recognition pass runs every `window_secs` of buffered speech and
/// keeps `overlap_ratio` of the window for the next pass.
///
/// ## Queues and timeouts:
/// Inbound audio waits at most `enqueue_timeout_secs` for queue space before it is
/// dropped; an idle inbound loop sends a keepalive after `idle_timeout_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub vad_threshold: f64,
    pub silence_timeout_secs: f64,
    pub min_speech_duration_secs: f64,
    pub max_speech_duration_secs: f64,
    pub window_secs: f64,
    pub overlap_ratio: f64,
    pub max_consecutive_errors: u32,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub enqueue_timeout_secs: f64,
    pub idle_timeout_secs: f64,
    pub cleanup_grace_secs: f64,
    pub history_turns: usize,
    pub closing_line: String,
}

/// Speech and dialog provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub recognizer: RecognizerConfig,
    pub synthesizer: SynthesizerConfig,
    pub planner: PlannerConfig,
}

/// Speech-to-text providers.
///
/// `primary` and `fallback` name one of `"openai"` or `"whisper_server"`.
/// An empty `fallback` disables failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub primary: String,
    pub fallback: String,
    pub auto_switch: bool,
    pub openai_base_url: String,
    pub api_key: String,
    pub model: String,
    pub whisper_server_url: String,
    pub language: String,
}

/// Text-to-speech providers: `"openai"` or `"local"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    pub primary: String,
    pub fallback: String,
    pub auto_switch: bool,
    pub openai_base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub local_tts_url: String,
    pub chunk_size: usize,
}

/// Next-question generation: `"llm"` or `"scripted"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub kind: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_questions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upper bound on simultaneously connected voice sessions
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
            },
            voice: VoiceConfig {
                vad_threshold: 0.005,
                silence_timeout_secs: 2.0,
                min_speech_duration_secs: 0.5,
                max_speech_duration_secs: 30.0,
                window_secs: 0.4,
                overlap_ratio: 0.2,
                max_consecutive_errors: 5,
                inbound_queue_capacity: 100,
                outbound_queue_capacity: 100,
                enqueue_timeout_secs: 5.0,
                idle_timeout_secs: 30.0,
                cleanup_grace_secs: 5.0,
                history_turns: 10,
                closing_line: "Thank you for your time today. That concludes our interview."
                    .to_string(),
            },
            providers: ProvidersConfig {
                recognizer: RecognizerConfig {
                    primary: "openai".to_string(),
                    fallback: "whisper_server".to_string(),
                    auto_switch: true,
                    openai_base_url: "https://api.openai.com/v1".to_string(),
                    api_key: String::new(),
                    model: "whisper-1".to_string(),
                    whisper_server_url: "http://127.0.0.1:8178/inference".to_string(),
                    language: String::new(),
                },
                synthesizer: SynthesizerConfig {
                    primary: "openai".to_string(),
                    fallback: "local".to_string(),
                    auto_switch: true,
                    openai_base_url: "https://api.openai.com/v1".to_string(),
                    api_key: String::new(),
                    model: "tts-1".to_string(),
                    voice: "nova".to_string(),
                    local_tts_url: "http://127.0.0.1:5005/tts".to_string(),
                    chunk_size: 4096,
                },
                planner: PlannerConfig {
                    kind: "llm".to_string(),
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key: String::new(),
                    model: "gpt-4o-mini".to_string(),
                    max_tokens: 200,
                    temperature: 0.7,
                    max_questions: 8,
                },
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_VOICE__SILENCE_TIMEOUT_SECS=1.5`: Shorter end-of-turn silence
    /// - `APP_PROVIDERS__PLANNER__KIND=scripted`: Offline question bank
    /// - `OPENAI_API_KEY=...`: Key shared by every OpenAI-compatible provider
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.apply_shared_api_key(&key);
        }

        config.voice.clamp_segmentation();
        Ok(config)
    }

    /// Fill in any provider API key left empty.
    fn apply_shared_api_key(&mut self, key: &str) {
        let providers = &mut self.providers;
        for slot in [
            &mut providers.recognizer.api_key,
            &mut providers.synthesizer.api_key,
            &mut providers.planner.api_key,
        ] {
            if slot.is_empty() {
                *slot = key.to_string();
            }
        }
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM audio is supported"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let voice = &self.voice;
        if voice.window_secs <= 0.0 {
            return Err(anyhow::anyhow!("Recognition window must be greater than 0"));
        }

        if !(0.0..1.0).contains(&voice.overlap_ratio) {
            return Err(anyhow::anyhow!("Overlap ratio must be in [0, 1)"));
        }

        if voice.inbound_queue_capacity == 0 || voice.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacities must be greater than 0"));
        }

        if voice.max_consecutive_errors == 0 {
            return Err(anyhow::anyhow!("Max consecutive errors must be greater than 0"));
        }

        if voice.enqueue_timeout_secs <= 0.0 || voice.idle_timeout_secs <= 0.0 {
            return Err(anyhow::anyhow!("Queue timeouts must be greater than 0"));
        }

        if voice.history_turns == 0 {
            return Err(anyhow::anyhow!("History must keep at least one turn"));
        }

        if !matches!(self.providers.planner.kind.as_str(), "llm" | "scripted") {
            return Err(anyhow::anyhow!(
                "Unknown planner kind '{}'",
                self.providers.planner.kind
            ));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used for runtime config updates).
    ///
    /// Only the fields present in the JSON change; for example
    /// `{"voice": {"silence_timeout_secs": 1.0}}` leaves everything else alone.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, &partial);

        let mut updated: AppConfig =
            serde_json::from_value(current).context("invalid configuration update")?;
        updated.voice.clamp_segmentation();
        updated.validate()?;

        *self = updated;
        Ok(())
    }
}

impl AudioConfig {
    pub fn buffer_config(&self, overlap_ratio: f64) -> AudioBufferConfig {
        AudioBufferConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
            overlap_ratio,
        }
    }
}

impl VoiceConfig {
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            threshold: self.vad_threshold,
            silence_timeout_secs: self.silence_timeout_secs,
            min_speech_duration_secs: self.min_speech_duration_secs,
            max_speech_duration_secs: self.max_speech_duration_secs,
        }
        .clamped()
    }

    fn clamp_segmentation(&mut self) {
        let clamped = self.segmenter_config();
        self.vad_threshold = clamped.threshold;
        self.silence_timeout_secs = clamped.silence_timeout_secs;
        self.min_speech_duration_secs = clamped.min_speech_duration_secs;
        self.max_speech_duration_secs = clamped.max_speech_duration_secs;
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.enqueue_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_grace_secs.max(0.0))
    }
}

/// Recursively overlay `patch` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.voice.max_consecutive_errors, 5);
        assert_eq!(config.voice.window_secs, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voice.overlap_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.planner.kind = "oracle".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "voice": {"silence_timeout_secs": 1.5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.voice.silence_timeout_secs, 1.5);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.voice.min_speech_duration_secs, 0.5);
    }

    #[test]
    fn test_config_update_clamps_segmentation() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"voice": {"vad_threshold": 7.0, "max_speech_duration_secs": 1.0}}"#)
            .unwrap();
        assert_eq!(config.voice.vad_threshold, 1.0);
        assert_eq!(config.voice.max_speech_duration_secs, 5.0);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_shared_api_key_fills_empty_slots() {
        let mut config = AppConfig::default();
        config.providers.planner.api_key = "planner-key".to_string();
        config.apply_shared_api_key("shared");
        assert_eq!(config.providers.recognizer.api_key, "shared");
        assert_eq!(config.providers.synthesizer.api_key, "shared");
        assert_eq!(config.providers.planner.api_key, "planner-key");
    }
}
