//! # Speech Synthesis Providers
//!
//! `Synthesizer` returns a lazy, finite stream of audio chunks for one utterance.
//! The conversation actor relays chunks to the client as they arrive.

use crate::error::VoiceError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::json;

/// Chunked synthesized audio. Not restartable.
pub type AudioStream = BoxStream<'static, Result<Bytes, VoiceError>>;

/// Text-to-speech capability consumed by the conversation actor.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_speech(&self, text: &str) -> Result<AudioStream, VoiceError>;
}

/// OpenAI-compatible `/audio/speech` endpoint, relayed as the body streams in.
pub struct OpenAiSynthesizer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl OpenAiSynthesizer {
    pub fn new(client: Client, base_url: &str, api_key: &str, model: &str, voice: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            voice: voice.to_string(),
        }
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream_speech(&self, text: &str) -> Result<AudioStream, VoiceError> {
        let url = format!("{}/audio/speech", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "input": text,
                "voice": self.voice,
                "response_format": "pcm",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("{} returned {}: {}", url, status, body)));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(VoiceError::from))
            .boxed())
    }
}

/// Local HTTP TTS service (Piper style) returning the whole utterance at once.
///
/// The response is split into fixed-size chunks so the client sees the same
/// framing as a streaming provider.
pub struct LocalTtsSynthesizer {
    client: Client,
    url: String,
    chunk_size: usize,
}

impl LocalTtsSynthesizer {
    pub fn new(client: Client, url: &str, chunk_size: usize) -> Self {
        Self {
            client,
            url: url.to_string(),
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl Synthesizer for LocalTtsSynthesizer {
    fn name(&self) -> &str {
        "local"
    }

    async fn stream_speech(&self, text: &str) -> Result<AudioStream, VoiceError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }

        let audio = response.bytes().await?;
        let chunks = chunk_audio(audio, self.chunk_size);
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Split a buffer into chunks of at most `chunk_size` bytes without copying.
pub fn chunk_audio(audio: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(audio.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < audio.len() {
        let end = (offset + chunk_size).min(audio.len());
        chunks.push(audio.slice(offset..end));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_audio_sizes() {
        let chunks = chunk_audio(Bytes::from(vec![1u8; 10]), 4);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_chunk_audio_empty() {
        assert!(chunk_audio(Bytes::new(), 4).is_empty());
    }

    #[test]
    fn test_chunk_audio_preserves_order() {
        let audio: Vec<u8> = (0..9).collect();
        let joined: Vec<u8> = chunk_audio(Bytes::from(audio.clone()), 2)
            .into_iter()
            .flat_map(|c| c.to_vec())
            .collect();
        assert_eq!(joined, audio);
    }
}
