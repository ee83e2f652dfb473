//! # Speech Recognition Providers
//!
//! The voice pipeline only sees the `Recognizer` capability. Two HTTP backends
//! implement it:
//! - **OpenAI-compatible**: `POST {base}/audio/transcriptions` (hosted Whisper and clones)
//! - **Whisper server**: a local `whisper.cpp` style `/inference` endpoint
//!
//! Both receive raw PCM from the pipeline and upload it as a WAV file.

use crate::audio::processor::AudioProcessor;
use crate::error::VoiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

/// Confidence reported when a provider gives none.
const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Output of one recognition pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: f64,
    pub is_final: bool,
    /// Seconds of audio that were recognized
    pub duration: f64,
    pub word_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptionResult {
    pub fn new(text: impl Into<String>, confidence: f64, duration: f64) -> Self {
        let text = text.into().trim().to_string();
        Self {
            word_count: text.split_whitespace().count(),
            text,
            confidence: confidence.clamp(0.0, 1.0),
            is_final: false,
            duration,
            timestamp: Utc::now(),
        }
    }

    /// Mark whether this result closes the turn.
    pub fn with_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }
}

/// Speech-to-text capability consumed by the conversation actor.
///
/// Any error is treated as a failed attempt for the current turn.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize raw PCM audio. `prompt` carries the text recognized so far in
    /// this turn and biases the model toward a consistent continuation.
    async fn speech_to_text(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> Result<TranscriptionResult, VoiceError>;
}

/// OpenAI-compatible transcription endpoint.
pub struct OpenAiRecognizer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    processor: AudioProcessor,
}

impl OpenAiRecognizer {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: &str,
        model: &str,
        language: Option<String>,
        processor: AudioProcessor,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            language,
            processor,
        }
    }
}

#[async_trait]
impl Recognizer for OpenAiRecognizer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn speech_to_text(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> Result<TranscriptionResult, VoiceError> {
        let wav = self.processor.pcm_to_wav(audio)?;
        let audio_secs = audio.len() as f64 / self.processor.config().bytes_per_second();

        let file = Part::bytes(wav).file_name("audio.wav").mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            form = form.text("prompt", prompt.to_string());
        }
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Recognition(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }

        let body: serde_json::Value = response.json().await?;
        debug!("Transcribed {:.2}s of audio via {}", audio_secs, self.name());
        parse_transcription(&body, audio_secs)
    }
}

/// Local whisper HTTP server (`whisper.cpp` `server` example and compatibles).
pub struct WhisperServerRecognizer {
    client: Client,
    url: String,
    language: Option<String>,
    processor: AudioProcessor,
}

impl WhisperServerRecognizer {
    pub fn new(client: Client, url: &str, language: Option<String>, processor: AudioProcessor) -> Self {
        Self {
            client,
            url: url.to_string(),
            language,
            processor,
        }
    }
}

#[async_trait]
impl Recognizer for WhisperServerRecognizer {
    fn name(&self) -> &str {
        "whisper_server"
    }

    async fn speech_to_text(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> Result<TranscriptionResult, VoiceError> {
        let wav = self.processor.pcm_to_wav(audio)?;
        let audio_secs = audio.len() as f64 / self.processor.config().bytes_per_second();

        let file = Part::bytes(wav).file_name("audio.wav").mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", file)
            .text("response_format", "json")
            .text("temperature", "0.0");
        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            form = form.text("prompt", prompt.to_string());
        }
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self.client.post(&self.url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Recognition(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }

        let body: serde_json::Value = response.json().await?;
        parse_transcription(&body, audio_secs)
    }
}

/// Build a result from a provider's JSON body.
///
/// ## Accepted fields:
/// - `text` (required)
/// - `duration` (falls back to the uploaded audio length)
/// - `segments[].avg_logprob` (averaged and mapped to a 0..1 confidence)
fn parse_transcription(
    body: &serde_json::Value,
    audio_secs: f64,
) -> Result<TranscriptionResult, VoiceError> {
    let text = body
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| VoiceError::Recognition("response has no text field".to_string()))?;

    let duration = body
        .get("duration")
        .and_then(|v| v.as_f64())
        .unwrap_or(audio_secs);

    let confidence = body
        .get("segments")
        .and_then(|v| v.as_array())
        .filter(|segments| !segments.is_empty())
        .map(|segments| {
            let logprobs: Vec<f64> = segments
                .iter()
                .filter_map(|s| s.get("avg_logprob").and_then(|v| v.as_f64()))
                .collect();
            if logprobs.is_empty() {
                DEFAULT_CONFIDENCE
            } else {
                (logprobs.iter().sum::<f64>() / logprobs.len() as f64).exp()
            }
        })
        .unwrap_or(DEFAULT_CONFIDENCE);

    Ok(TranscriptionResult::new(text, confidence, duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_counts_words() {
        let result = TranscriptionResult::new("  I led the migration project ", 0.8, 1.2);
        assert_eq!(result.text, "I led the migration project");
        assert_eq!(result.word_count, 5);
        assert!(!result.is_final);
        assert!(result.with_final(true).is_final);
    }

    #[test]
    fn test_parse_plain_response() {
        let result = parse_transcription(&json!({"text": "hello there"}), 0.75).unwrap();
        assert_eq!(result.text, "hello there");
        assert_eq!(result.duration, 0.75);
        assert_eq!(result.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_parse_verbose_response() {
        let body = json!({
            "text": "hello",
            "duration": 2.5,
            "segments": [{"avg_logprob": 0.0}, {"avg_logprob": 0.0}]
        });
        let result = parse_transcription(&body, 1.0).unwrap();
        assert_eq!(result.duration, 2.5);
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_missing_text() {
        assert!(matches!(
            parse_transcription(&json!({"error": "nope"}), 1.0),
            Err(VoiceError::Recognition(_))
        ));
    }
}
