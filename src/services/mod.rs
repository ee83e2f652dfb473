//! # External Speech and Dialog Services
//!
//! Capability interfaces the voice pipeline consumes, their HTTP
//! implementations, and the failover policy that composes them.

pub mod failover;     // Primary/secondary provider policy
pub mod planner;      // Next-question generation
pub mod recognizer;   // Speech-to-text
pub mod synthesizer;  // Text-to-speech

use crate::audio::processor::AudioProcessor;
use crate::config::AppConfig;
use anyhow::{anyhow, Result};
use failover::{FailoverRecognizer, FailoverStats, FailoverSynthesizer};
use planner::{DialogPlanner, LlmPlanner, ScriptedPlanner};
use recognizer::{OpenAiRecognizer, Recognizer, WhisperServerRecognizer};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use synthesizer::{LocalTtsSynthesizer, OpenAiSynthesizer, Synthesizer};

/// The collaborators handed to every conversation actor.
#[derive(Clone)]
pub struct VoiceServices {
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub planner: Arc<dyn DialogPlanner>,
    recognizer_failover: Option<Arc<FailoverRecognizer>>,
    synthesizer_failover: Option<Arc<FailoverSynthesizer>>,
}

impl VoiceServices {
    /// Use the given collaborators directly, without failover bookkeeping.
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        synthesizer: Arc<dyn Synthesizer>,
        planner: Arc<dyn DialogPlanner>,
    ) -> Self {
        Self {
            recognizer,
            synthesizer,
            planner,
            recognizer_failover: None,
            synthesizer_failover: None,
        }
    }

    /// Build HTTP-backed providers from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let processor = AudioProcessor::new(config.audio.buffer_config(config.voice.overlap_ratio));

        let rec = &config.providers.recognizer;
        let recognizer = Arc::new(FailoverRecognizer::new(
            build_recognizer(&rec.primary, config, &client, &processor)?,
            optional(&rec.fallback)
                .map(|name| build_recognizer(name, config, &client, &processor))
                .transpose()?,
            rec.auto_switch,
        ));

        let syn = &config.providers.synthesizer;
        let synthesizer = Arc::new(FailoverSynthesizer::new(
            build_synthesizer(&syn.primary, config, &client)?,
            optional(&syn.fallback)
                .map(|name| build_synthesizer(name, config, &client))
                .transpose()?,
            syn.auto_switch,
        ));

        let plan = &config.providers.planner;
        let planner: Arc<dyn DialogPlanner> = match plan.kind.as_str() {
            "scripted" => Arc::new(ScriptedPlanner::new(plan.max_questions)),
            "llm" => Arc::new(LlmPlanner::new(
                client.clone(),
                &plan.base_url,
                &plan.api_key,
                &plan.model,
                plan.max_tokens,
                plan.temperature,
                plan.max_questions,
            )),
            other => return Err(anyhow!("Unknown planner kind '{}'", other)),
        };

        Ok(Self {
            recognizer: recognizer.clone(),
            synthesizer: synthesizer.clone(),
            planner,
            recognizer_failover: Some(recognizer),
            synthesizer_failover: Some(synthesizer),
        })
    }

    /// Provider health for the status endpoint.
    pub fn provider_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "recognizer": self.recognizer_stats(),
            "synthesizer": self.synthesizer_failover.as_ref().map(|f| f.stats()),
            "planner": self.planner.name(),
        })
    }

    pub fn recognizer_stats(&self) -> Option<FailoverStats> {
        self.recognizer_failover.as_ref().map(|f| f.stats())
    }
}

fn optional(name: &str) -> Option<&str> {
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

fn build_recognizer(
    name: &str,
    config: &AppConfig,
    client: &Client,
    processor: &AudioProcessor,
) -> Result<Arc<dyn Recognizer>> {
    let rec = &config.providers.recognizer;
    let language = optional(&rec.language).map(str::to_string);
    match name {
        "openai" => Ok(Arc::new(OpenAiRecognizer::new(
            client.clone(),
            &rec.openai_base_url,
            &rec.api_key,
            &rec.model,
            language,
            processor.clone(),
        ))),
        "whisper_server" => Ok(Arc::new(WhisperServerRecognizer::new(
            client.clone(),
            &rec.whisper_server_url,
            language,
            processor.clone(),
        ))),
        other => Err(anyhow!("Unknown recognizer provider '{}'", other)),
    }
}

fn build_synthesizer(name: &str, config: &AppConfig, client: &Client) -> Result<Arc<dyn Synthesizer>> {
    let syn = &config.providers.synthesizer;
    match name {
        "openai" => Ok(Arc::new(OpenAiSynthesizer::new(
            client.clone(),
            &syn.openai_base_url,
            &syn.api_key,
            &syn.model,
            &syn.voice,
        ))),
        "local" => Ok(Arc::new(LocalTtsSynthesizer::new(
            client.clone(),
            &syn.local_tts_url,
            syn.chunk_size,
        ))),
        other => Err(anyhow!("Unknown synthesizer provider '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_from_default_config() {
        let services = VoiceServices::from_config(&AppConfig::default()).unwrap();
        assert_eq!(services.planner.name(), "llm");
        let stats = services.recognizer_stats().unwrap();
        assert_eq!(stats.active, "openai");
        assert_eq!(stats.calls, 0);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut config = AppConfig::default();
        config.providers.recognizer.primary = "carrier-pigeon".to_string();
        assert!(VoiceServices::from_config(&config).is_err());
    }

    #[test]
    fn test_scripted_planner_without_fallbacks() {
        let mut config = AppConfig::default();
        config.providers.planner.kind = "scripted".to_string();
        config.providers.recognizer.fallback = String::new();
        let services = VoiceServices::from_config(&config).unwrap();
        assert_eq!(services.planner.name(), "scripted");
        assert_eq!(services.provider_stats()["planner"], "scripted");
    }
}
