//! # Provider Failover
//!
//! Wraps a primary and an optional secondary provider behind the same
//! capability trait. A failed call on the active provider is retried once on
//! the other; with `auto_switch` the provider that succeeded becomes active.

use crate::error::VoiceError;
use crate::services::recognizer::{Recognizer, TranscriptionResult};
use crate::services::synthesizer::{AudioStream, Synthesizer};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Counters exposed on the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    pub calls: u64,
    pub errors: u64,
    pub switches: u64,
    pub active: String,
}

/// Shared bookkeeping for one primary/secondary pair.
#[derive(Debug)]
struct FailoverPolicy {
    names: Vec<String>,
    auto_switch: bool,
    active: AtomicUsize,
    calls: AtomicU64,
    errors: AtomicU64,
    switches: AtomicU64,
}

impl FailoverPolicy {
    fn new(names: Vec<String>, auto_switch: bool) -> Self {
        Self {
            names,
            auto_switch,
            active: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            switches: AtomicU64::new(0),
        }
    }

    /// Provider indices in the order they should be tried.
    fn attempt_order(&self) -> Vec<usize> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let active = self.active.load(Ordering::Relaxed);
        let mut order = vec![active];
        order.extend((0..self.names.len()).filter(|&i| i != active));
        order
    }

    fn record_failure(&self, index: usize, error: &VoiceError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Provider '{}' failed: {}", self.names[index], error);
    }

    fn record_success(&self, index: usize) {
        if !self.auto_switch {
            return;
        }
        let previous = self.active.swap(index, Ordering::Relaxed);
        if previous != index {
            self.switches.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Switched provider from '{}' to '{}'",
                self.names[previous], self.names[index]
            );
        }
    }

    fn stats(&self) -> FailoverStats {
        FailoverStats {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            active: self.names[self.active.load(Ordering::Relaxed)].clone(),
        }
    }
}

pub struct FailoverRecognizer {
    providers: Vec<Arc<dyn Recognizer>>,
    policy: FailoverPolicy,
}

impl FailoverRecognizer {
    pub fn new(
        primary: Arc<dyn Recognizer>,
        secondary: Option<Arc<dyn Recognizer>>,
        auto_switch: bool,
    ) -> Self {
        let providers: Vec<Arc<dyn Recognizer>> = std::iter::once(primary).chain(secondary).collect();
        let names = providers.iter().map(|p| p.name().to_string()).collect();
        Self {
            providers,
            policy: FailoverPolicy::new(names, auto_switch),
        }
    }

    pub fn stats(&self) -> FailoverStats {
        self.policy.stats()
    }
}

#[async_trait]
impl Recognizer for FailoverRecognizer {
    fn name(&self) -> &str {
        "failover"
    }

    async fn speech_to_text(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> Result<TranscriptionResult, VoiceError> {
        let mut last_error = None;
        for index in self.policy.attempt_order() {
            match self.providers[index].speech_to_text(audio, prompt).await {
                Ok(result) => {
                    self.policy.record_success(index);
                    return Ok(result);
                }
                Err(e) => {
                    self.policy.record_failure(index, &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| VoiceError::Recognition("no recognizer configured".to_string())))
    }
}

pub struct FailoverSynthesizer {
    providers: Vec<Arc<dyn Synthesizer>>,
    policy: FailoverPolicy,
}

impl FailoverSynthesizer {
    pub fn new(
        primary: Arc<dyn Synthesizer>,
        secondary: Option<Arc<dyn Synthesizer>>,
        auto_switch: bool,
    ) -> Self {
        let providers: Vec<Arc<dyn Synthesizer>> = std::iter::once(primary).chain(secondary).collect();
        let names = providers.iter().map(|p| p.name().to_string()).collect();
        Self {
            providers,
            policy: FailoverPolicy::new(names, auto_switch),
        }
    }

    pub fn stats(&self) -> FailoverStats {
        self.policy.stats()
    }
}

#[async_trait]
impl Synthesizer for FailoverSynthesizer {
    fn name(&self) -> &str {
        "failover"
    }

    /// Failover covers opening the stream; errors mid-stream surface to the caller.
    async fn stream_speech(&self, text: &str) -> Result<AudioStream, VoiceError> {
        let mut last_error = None;
        for index in self.policy.attempt_order() {
            match self.providers[index].stream_speech(text).await {
                Ok(stream) => {
                    self.policy.record_success(index);
                    return Ok(stream);
                }
                Err(e) => {
                    self.policy.record_failure(index, &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| VoiceError::Synthesis("no synthesizer configured".to_string())))
    }
}
