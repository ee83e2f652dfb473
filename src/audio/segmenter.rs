//! # Speech Turn Segmentation
//!
//! Voice activity detection plus the turn state machine that splits a
//! continuous PCM stream into discrete utterances.
//!
//! ## State Machine:
//! - **Silence** → **Speech** on the first voiced chunk
//! - **Speech** → **Processing** when silence outlasts the timeout (and the
//!   voiced span reaches the minimum) or the voiced span hits the maximum
//! - **Speech** → **Silence** when the voiced span was too short (noise)
//! - **Processing** → **Silence** once the caller finishes the finalize attempt
//! - **Speaking** marks assistant playback; a voiced chunk barges in
//!
//! ## Timing:
//! Time is measured on the media clock (bytes consumed ÷ byte rate), not the
//! wall clock, so segmentation depends only on the audio itself.

use crate::audio::buffer::AudioBufferConfig;
use crate::audio::processor::mean_abs_energy;
use serde::{Deserialize, Serialize};

/// Voice activity state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceActivityState {
    Silence,
    Speech,
    Processing,
    Speaking,
}

impl VoiceActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceActivityState::Silence => "silence",
            VoiceActivityState::Speech => "speech",
            VoiceActivityState::Processing => "processing",
            VoiceActivityState::Speaking => "speaking",
        }
    }
}

/// Tunable segmentation parameters.
///
/// ## Ranges (enforced by `clamped`):
/// - `threshold`: 0.001 ..= 1.0
/// - `silence_timeout_secs`: 0.5 ..= 10
/// - `min_speech_duration_secs`: 0.1 ..= 5
/// - `max_speech_duration_secs`: 5 ..= 60
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    pub threshold: f64,
    pub silence_timeout_secs: f64,
    pub min_speech_duration_secs: f64,
    pub max_speech_duration_secs: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.005,
            silence_timeout_secs: 2.0,
            min_speech_duration_secs: 0.5,
            max_speech_duration_secs: 30.0,
        }
    }
}

impl SegmenterConfig {
    /// Return a copy with every field pulled into its allowed range.
    pub fn clamped(self) -> Self {
        Self {
            threshold: self.threshold.clamp(0.001, 1.0),
            silence_timeout_secs: self.silence_timeout_secs.clamp(0.5, 10.0),
            min_speech_duration_secs: self.min_speech_duration_secs.clamp(0.1, 5.0),
            max_speech_duration_secs: self.max_speech_duration_secs.clamp(5.0, 60.0),
        }
    }

    /// Apply a partial update from a client `configure` message, then clamp.
    pub fn apply(self, update: &SegmenterUpdate) -> Self {
        Self {
            threshold: update.threshold.unwrap_or(self.threshold),
            silence_timeout_secs: update.silence_timeout.unwrap_or(self.silence_timeout_secs),
            min_speech_duration_secs: update
                .min_speech_duration
                .unwrap_or(self.min_speech_duration_secs),
            max_speech_duration_secs: update
                .max_speech_duration
                .unwrap_or(self.max_speech_duration_secs),
        }
        .clamped()
    }
}

/// Partial segmenter settings carried by a `configure` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmenterUpdate {
    #[serde(default, alias = "vad_threshold")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub silence_timeout: Option<f64>,
    #[serde(default)]
    pub min_speech_duration: Option<f64>,
    #[serde(default)]
    pub max_speech_duration: Option<f64>,
}

/// Voice activity verdict for a single chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceActivity {
    pub is_speech: bool,
    pub energy: f64,
    /// energy ÷ threshold, capped at 1.0
    pub confidence: f64,
}

/// Why a turn was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    SilenceTimeout,
    MaxDuration,
}

/// Outcome of feeding one chunk to the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Nothing is happening (silence, or a finalize is in progress)
    Idle,
    /// First voiced chunk of a new turn
    SpeechStarted,
    /// Turn in progress
    Continuing,
    /// Turn complete; the caller must recognize it and then call `finish_turn`
    Finalize(FinalizeReason),
    /// Voiced span was shorter than the minimum; dropped as noise
    Discarded,
}

/// Voice activity state machine for one audio stream.
#[derive(Debug)]
pub struct SpeechTurnSegmenter {
    config: SegmenterConfig,
    bytes_per_second: f64,
    state: VoiceActivityState,
    /// Media bytes consumed so far
    clock: u64,
    speech_start: u64,
    last_speech_end: u64,
}

impl SpeechTurnSegmenter {
    pub fn new(config: SegmenterConfig, audio: &AudioBufferConfig) -> Self {
        Self {
            config: config.clamped(),
            bytes_per_second: audio.bytes_per_second(),
            state: VoiceActivityState::Silence,
            clock: 0,
            speech_start: 0,
            last_speech_end: 0,
        }
    }

    pub fn state(&self) -> VoiceActivityState {
        self.state
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Replace the parameters; values are clamped into range.
    pub fn configure(&mut self, update: &SegmenterUpdate) -> SegmenterConfig {
        self.config = self.config.apply(update);
        self.config
    }

    /// Classify a chunk by its normalized mean absolute amplitude.
    pub fn detect(&self, chunk: &[u8]) -> VoiceActivity {
        let energy = mean_abs_energy(chunk);
        VoiceActivity {
            is_speech: energy > self.config.threshold,
            energy,
            confidence: (energy / self.config.threshold).min(1.0),
        }
    }

    /// Length of the voiced span of the current turn, in seconds.
    pub fn speech_duration(&self) -> f64 {
        match self.state {
            VoiceActivityState::Speech | VoiceActivityState::Processing => {
                self.seconds(self.last_speech_end - self.speech_start)
            }
            _ => 0.0,
        }
    }

    /// Feed one chunk and advance the state machine.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> SegmentEvent {
        let activity = self.detect(chunk);
        let chunk_start = self.clock;
        self.clock += chunk.len() as u64;

        match self.state {
            VoiceActivityState::Silence | VoiceActivityState::Speaking => {
                if activity.is_speech {
                    self.speech_start = chunk_start;
                    self.last_speech_end = self.clock;
                    self.state = VoiceActivityState::Speech;
                    SegmentEvent::SpeechStarted
                } else {
                    SegmentEvent::Idle
                }
            }
            VoiceActivityState::Speech if activity.is_speech => {
                self.last_speech_end = self.clock;
                if self.speech_duration() >= self.config.max_speech_duration_secs {
                    self.state = VoiceActivityState::Processing;
                    SegmentEvent::Finalize(FinalizeReason::MaxDuration)
                } else {
                    SegmentEvent::Continuing
                }
            }
            VoiceActivityState::Speech => {
                let silent_for = self.seconds(self.clock - self.last_speech_end);
                if silent_for < self.config.silence_timeout_secs {
                    return SegmentEvent::Continuing;
                }
                if self.speech_duration() >= self.config.min_speech_duration_secs {
                    self.state = VoiceActivityState::Processing;
                    SegmentEvent::Finalize(FinalizeReason::SilenceTimeout)
                } else {
                    self.reset();
                    SegmentEvent::Discarded
                }
            }
            VoiceActivityState::Processing => SegmentEvent::Idle,
        }
    }

    /// Force the current turn into Processing (explicit end of input).
    ///
    /// Returns false when no turn is in progress.
    pub fn force_finalize(&mut self) -> bool {
        if self.state == VoiceActivityState::Speech {
            self.state = VoiceActivityState::Processing;
            true
        } else {
            false
        }
    }

    /// Finalize attempt finished (success or failure); back to Silence.
    pub fn finish_turn(&mut self) {
        self.reset();
    }

    /// Mark assistant playback. Only entered from Silence.
    pub fn begin_speaking(&mut self) -> bool {
        if self.state == VoiceActivityState::Silence {
            self.state = VoiceActivityState::Speaking;
            true
        } else {
            false
        }
    }

    /// Playback finished. Leaves any turn the user started meanwhile untouched.
    pub fn end_speaking(&mut self) -> bool {
        if self.state == VoiceActivityState::Speaking {
            self.state = VoiceActivityState::Silence;
            true
        } else {
            false
        }
    }

    fn seconds(&self, bytes: u64) -> f64 {
        if self.bytes_per_second <= 0.0 {
            return 0.0;
        }
        bytes as f64 / self.bytes_per_second
    }

    fn reset(&mut self) {
        self.state = VoiceActivityState::Silence;
        self.speech_start = self.clock;
        self.last_speech_end = self.clock;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 0.2s chunk of 16kHz mono PCM16 at a constant amplitude.
    fn chunk(amplitude: i16) -> Vec<u8> {
        let samples = 3200;
        let mut data = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let value = if i % 2 == 0 { amplitude } else { amplitude.saturating_neg() };
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    fn speech() -> Vec<u8> {
        chunk(8000)
    }

    fn silence() -> Vec<u8> {
        chunk(0)
    }

    fn segmenter() -> SpeechTurnSegmenter {
        SpeechTurnSegmenter::new(SegmenterConfig::default(), &AudioBufferConfig::default())
    }

    #[test]
    fn test_detection_uses_threshold() {
        let seg = segmenter();
        assert!(seg.detect(&speech()).is_speech);
        assert!(!seg.detect(&silence()).is_speech);
        assert_eq!(seg.detect(&speech()).confidence, 1.0);
        assert_eq!(seg.detect(&silence()).confidence, 0.0);
    }

    #[test]
    fn test_short_speech_run_is_discarded() {
        let mut seg = segmenter();
        assert_eq!(seg.process_chunk(&silence()), SegmentEvent::Idle);
        assert_eq!(seg.process_chunk(&speech()), SegmentEvent::SpeechStarted);
        assert_eq!(seg.process_chunk(&speech()), SegmentEvent::Continuing);
        assert_eq!(seg.state(), VoiceActivityState::Speech);

        // 0.4s voiced span; silence keeps the turn open until the timeout
        let mut events = Vec::new();
        for _ in 0..10 {
            events.push(seg.process_chunk(&silence()));
        }
        assert!(events[..9].iter().all(|e| *e == SegmentEvent::Continuing));
        assert_eq!(events[9], SegmentEvent::Discarded);
        assert!(!events.iter().any(|e| matches!(e, SegmentEvent::Finalize(_))));
        assert_eq!(seg.state(), VoiceActivityState::Silence);
    }

    #[test]
    fn test_long_speech_run_finalizes_once() {
        let mut seg = segmenter();
        let mut finalized = 0;
        seg.process_chunk(&speech());
        for _ in 0..4 {
            seg.process_chunk(&speech());
        }
        for _ in 0..12 {
            if let SegmentEvent::Finalize(reason) = seg.process_chunk(&silence()) {
                assert_eq!(reason, FinalizeReason::SilenceTimeout);
                finalized += 1;
                seg.finish_turn();
            }
        }
        assert_eq!(finalized, 1);
        assert_eq!(seg.state(), VoiceActivityState::Silence);
    }

    #[test]
    fn test_finalize_count_matches_qualifying_runs() {
        let mut seg = segmenter();
        // runs of 1, 5, 2 and 4 voiced chunks (0.2s each) separated by 2.2s of silence
        let runs = [1usize, 5, 2, 4];
        let mut finalized = 0;
        let mut discarded = 0;
        for run in runs {
            for _ in 0..run {
                seg.process_chunk(&speech());
            }
            for _ in 0..11 {
                match seg.process_chunk(&silence()) {
                    SegmentEvent::Finalize(_) => {
                        finalized += 1;
                        seg.finish_turn();
                    }
                    SegmentEvent::Discarded => discarded += 1,
                    _ => {}
                }
            }
        }
        // 0.2s and 0.4s runs are below the 0.5s minimum
        assert_eq!(finalized, 2);
        assert_eq!(discarded, 2);
    }

    #[test]
    fn test_runaway_speech_is_force_finalized() {
        let mut seg = SpeechTurnSegmenter::new(
            SegmenterConfig {
                max_speech_duration_secs: 5.0,
                ..SegmenterConfig::default()
            },
            &AudioBufferConfig::default(),
        );
        let mut reason = None;
        for _ in 0..30 {
            if let SegmentEvent::Finalize(r) = seg.process_chunk(&speech()) {
                reason = Some(r);
                break;
            }
        }
        assert_eq!(reason, Some(FinalizeReason::MaxDuration));
        assert_eq!(seg.state(), VoiceActivityState::Processing);
        // chunks arriving mid-finalize do not move the machine
        assert_eq!(seg.process_chunk(&speech()), SegmentEvent::Idle);
        seg.finish_turn();
        assert_eq!(seg.state(), VoiceActivityState::Silence);
    }

    #[test]
    fn test_configure_clamps_values() {
        let mut seg = segmenter();
        let applied = seg.configure(&SegmenterUpdate {
            threshold: Some(5.0),
            silence_timeout: Some(0.1),
            min_speech_duration: Some(9.0),
            max_speech_duration: Some(120.0),
        });
        assert_eq!(applied.threshold, 1.0);
        assert_eq!(applied.silence_timeout_secs, 0.5);
        assert_eq!(applied.min_speech_duration_secs, 5.0);
        assert_eq!(applied.max_speech_duration_secs, 60.0);

        let partial = seg.configure(&SegmenterUpdate {
            threshold: Some(0.02),
            ..SegmenterUpdate::default()
        });
        assert_eq!(partial.threshold, 0.02);
        assert_eq!(partial.silence_timeout_secs, 0.5);
    }

    #[test]
    fn test_speaking_state_allows_barge_in() {
        let mut seg = segmenter();
        assert!(seg.begin_speaking());
        assert_eq!(seg.process_chunk(&silence()), SegmentEvent::Idle);
        assert_eq!(seg.state(), VoiceActivityState::Speaking);
        assert_eq!(seg.process_chunk(&speech()), SegmentEvent::SpeechStarted);
        // playback ending does not abort the user's turn
        assert!(!seg.end_speaking());
        assert_eq!(seg.state(), VoiceActivityState::Speech);
    }

    #[test]
    fn test_force_finalize_only_during_speech() {
        let mut seg = segmenter();
        assert!(!seg.force_finalize());
        seg.process_chunk(&speech());
        assert!(seg.force_finalize());
        assert_eq!(seg.state(), VoiceActivityState::Processing);
    }
}
