//! # Audio Processing and Validation
//!
//! PCM16 helpers shared by the voice pipeline:
//! - **Validation**: chunks must be whole little-endian 16-bit frames
//! - **Energy**: normalized mean absolute amplitude used for voice activity
//! - **Containers**: wrap raw PCM in a WAV header for HTTP speech providers
//! - **Transport decoding**: base64 payloads from `audio_chunk` messages

use crate::audio::buffer::AudioBufferConfig;
use crate::error::VoiceError;
use base64::{engine::general_purpose, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Full-scale magnitude of a signed 16-bit sample.
const PCM16_FULL_SCALE: f64 = 32768.0;

/// Audio format validation and conversion for one session's stream.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    config: AudioBufferConfig,
}

impl AudioProcessor {
    pub fn new(config: AudioBufferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AudioBufferConfig {
        &self.config
    }

    /// Validate an incoming PCM chunk.
    ///
    /// ## Validation Checks:
    /// 1. **Data length**: Must not be empty
    /// 2. **Alignment**: Must hold a whole number of frames
    /// 3. **Sample rate**: When the client declares one, it must match the stream
    pub fn validate_chunk(&self, data: &[u8], declared_rate: Option<u32>) -> Result<(), VoiceError> {
        if data.is_empty() {
            return Err(VoiceError::InvalidAudio("Audio data is empty".to_string()));
        }

        let frame = self.config.bytes_per_frame();
        if data.len() % frame != 0 {
            return Err(VoiceError::InvalidAudio(format!(
                "Audio data length {} is not a multiple of the {}-byte frame size",
                data.len(),
                frame
            )));
        }

        if let Some(rate) = declared_rate {
            if rate != self.config.sample_rate {
                return Err(VoiceError::InvalidAudio(format!(
                    "Sample rate mismatch: expected {}, got {}",
                    self.config.sample_rate, rate
                )));
            }
        }

        Ok(())
    }

    /// Wrap raw PCM bytes in a WAV container.
    ///
    /// Speech-to-text HTTP APIs expect a file upload rather than bare samples.
    pub fn pcm_to_wav(&self, pcm: &[u8]) -> Result<Vec<u8>, VoiceError> {
        let header = wav::Header::new(
            wav::WAV_FORMAT_PCM,
            self.config.channels,
            self.config.sample_rate,
            self.config.bit_depth,
        );
        let track = wav::BitDepth::Sixteen(decode_samples(pcm));

        let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
        wav::write(header, &track, &mut out)
            .map_err(|e| VoiceError::InvalidAudio(format!("WAV encoding failed: {}", e)))?;
        Ok(out.into_inner())
    }
}

/// Decode little-endian PCM16 bytes into samples. A trailing odd byte is ignored.
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Normalized mean absolute amplitude of a PCM16 chunk, in [0.0, 1.0].
///
/// ## Calculation:
/// energy = mean(|sample|) / 32768
pub fn mean_abs_energy(data: &[u8]) -> f64 {
    let samples = decode_samples(data);
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|&s| (s as f64).abs()).sum();
    total / samples.len() as f64 / PCM16_FULL_SCALE
}

/// Decode the base64 `data` field of an `audio_chunk` message.
pub fn decode_base64_audio(encoded: &str) -> Result<Vec<u8>, VoiceError> {
    general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| VoiceError::InvalidAudio(format!("Invalid base64 audio payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_chunk_validation() {
        let processor = AudioProcessor::new(AudioBufferConfig::default());

        assert!(processor.validate_chunk(&pcm(&[1, 2, 3]), None).is_ok());
        assert!(processor.validate_chunk(&pcm(&[1, 2, 3]), Some(16000)).is_ok());

        // Odd number of bytes splits a sample
        assert!(processor.validate_chunk(&[0u8; 15], None).is_err());
        assert!(processor.validate_chunk(&[], None).is_err());
        assert!(processor.validate_chunk(&pcm(&[1]), Some(44100)).is_err());
    }

    #[test]
    fn test_energy_is_normalized() {
        assert_eq!(mean_abs_energy(&pcm(&[0, 0, 0, 0])), 0.0);

        let energy = mean_abs_energy(&pcm(&[16384, -16384]));
        assert!((energy - 0.5).abs() < 1e-9);

        let full = mean_abs_energy(&pcm(&[i16::MIN, i16::MIN]));
        assert!((full - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_wav_container_has_riff_header() {
        let processor = AudioProcessor::new(AudioBufferConfig::default());
        let wav_bytes = processor.pcm_to_wav(&pcm(&[100, -100, 200, -200])).unwrap();

        assert_eq!(&wav_bytes[0..4], b"RIFF");
        assert_eq!(&wav_bytes[8..12], b"WAVE");
        assert!(wav_bytes.len() > 8);
    }

    #[test]
    fn test_base64_decoding() {
        let encoded = general_purpose::STANDARD.encode(pcm(&[1, 2]));
        assert_eq!(decode_base64_audio(&encoded).unwrap(), pcm(&[1, 2]));
        assert!(decode_base64_audio("not base64!!").is_err());
    }
}
