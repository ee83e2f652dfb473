//! # Audio Processing Module
//!
//! Per-turn audio handling for the real-time voice pipeline.
//!
//! ## Key Components:
//! - **Audio Buffer**: Turn accumulator with windowing and overlap retention
//! - **Audio Processor**: PCM validation, energy, WAV wrapping, base64 decoding
//! - **Segmenter**: Voice activity detection and the speech turn state machine
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;     // Turn buffer with overlap
pub mod processor;  // PCM helpers
pub mod segmenter;  // VAD state machine
