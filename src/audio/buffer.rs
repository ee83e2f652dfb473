//! # Audio Buffer Management
//!
//! Byte accumulator for the current speech turn. Partial recognition windows
//! are cut from the pending tail of the turn while a trailing overlap stays
//! pending, so words spanning a window boundary are heard again by the next
//! partial pass. The whole turn stays available for the final pass.
//!
//! ## Key Features:
//! - **Frame alignment**: Overlap retention never splits a PCM sample
//! - **Configurable overlap**: Trailing ratio kept after each window (default 20%)
//! - **Duration from length**: bytes ÷ sample rate ÷ bytes per frame

/// Configuration for audio buffer behavior.
#[derive(Debug, Clone)]
pub struct AudioBufferConfig {
    /// Sample rate of the incoming PCM stream (16kHz for speech models)
    pub sample_rate: u32,

    /// Number of interleaved channels (mono for this pipeline)
    pub channels: u16,

    /// Bits per sample (16-bit PCM)
    pub bit_depth: u16,

    /// Fraction of a window kept pending after it is taken, in [0.0, 1.0)
    pub overlap_ratio: f64,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
            overlap_ratio: 0.2,
        }
    }
}

impl AudioBufferConfig {
    /// Number of bytes making up one frame (one sample across all channels).
    pub fn bytes_per_frame(&self) -> usize {
        (self.bit_depth as usize / 8).max(1) * (self.channels as usize).max(1)
    }

    /// Number of bytes per second of audio.
    pub fn bytes_per_second(&self) -> f64 {
        self.sample_rate as f64 * self.bytes_per_frame() as f64
    }
}

/// Per-turn audio accumulator.
///
/// Owned by a single conversation loop, so no interior locking is needed.
#[derive(Debug)]
pub struct AudioBuffer {
    data: Vec<u8>,
    /// Start of the audio not yet covered by a partial window (overlap included)
    window_start: usize,
    config: AudioBufferConfig,
}

impl AudioBuffer {
    pub fn new(config: AudioBufferConfig) -> Self {
        Self {
            data: Vec::new(),
            window_start: 0,
            config,
        }
    }

    /// Append raw PCM bytes to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Duration of the whole turn in seconds.
    ///
    /// ## Calculation:
    /// Duration = byte_length / sample_rate / bytes_per_frame
    pub fn duration_seconds(&self) -> f64 {
        self.seconds(self.data.len())
    }

    /// Duration of the audio the next `take_window` would return.
    pub fn window_duration_seconds(&self) -> f64 {
        self.seconds(self.data.len() - self.window_start)
    }

    /// Take the pending window for a partial recognition pass.
    ///
    /// ## Returns:
    /// Everything appended since the previous window, plus that window's
    /// retained overlap. Afterwards only the trailing `overlap_ratio` share of
    /// the returned bytes (rounded down to whole frames) stays pending.
    pub fn take_window(&mut self) -> Vec<u8> {
        let window = self.data[self.window_start..].to_vec();
        self.window_start = self.data.len() - self.overlap_len(window.len());
        window
    }

    fn overlap_len(&self, window_len: usize) -> usize {
        let frame = self.config.bytes_per_frame();
        let ratio = self.config.overlap_ratio.clamp(0.0, 1.0);
        let raw = (window_len as f64 * ratio) as usize;
        (raw / frame * frame).min(window_len)
    }

    fn seconds(&self, bytes: usize) -> f64 {
        let bytes_per_second = self.config.bytes_per_second();
        if bytes_per_second <= 0.0 {
            return 0.0;
        }
        bytes as f64 / bytes_per_second
    }

    /// Drop all buffered audio.
    pub fn clear(&mut self) {
        self.data.clear();
        self.window_start = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole turn, in arrival order.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn config(&self) -> &AudioBufferConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_from_byte_length() {
        let mut buffer = AudioBuffer::new(AudioBufferConfig::default());
        // 0.5s of 16kHz mono 16-bit audio
        buffer.append(&vec![0u8; 16000]);
        assert!((buffer.duration_seconds() - 0.5).abs() < 1e-9);
        assert_eq!(buffer.len(), 16000);
    }

    #[test]
    fn test_take_window_keeps_trailing_overlap() {
        let mut buffer = AudioBuffer::new(AudioBufferConfig::default());
        let bytes: Vec<u8> = (0..100u8).collect();
        buffer.append(&bytes);

        let window = buffer.take_window();
        assert_eq!(window, bytes);

        // 20% of 100 bytes = 20 bytes carried into the next window
        buffer.append(&[200, 201]);
        let next = buffer.take_window();
        assert_eq!(&next[..20], &bytes[80..]);
        assert_eq!(&next[20..], &[200, 201]);

        // The whole turn is still available for the final pass
        assert_eq!(buffer.len(), 102);
        assert_eq!(&buffer.as_bytes()[..100], &bytes[..]);
    }

    #[test]
    fn test_overlap_is_frame_aligned() {
        let mut buffer = AudioBuffer::new(AudioBufferConfig::default());
        buffer.append(&[1u8; 14]);
        buffer.take_window();
        // 20% of 14 = 2.8 bytes, rounded down to one whole 2-byte frame
        assert!((buffer.window_duration_seconds() - 2.0 / 32000.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_overlap_empties_window() {
        let mut buffer = AudioBuffer::new(AudioBufferConfig {
            overlap_ratio: 0.0,
            ..AudioBufferConfig::default()
        });
        buffer.append(&[7u8; 64]);
        assert_eq!(buffer.take_window().len(), 64);
        assert_eq!(buffer.window_duration_seconds(), 0.0);
        assert!(buffer.take_window().is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioBuffer::new(AudioBufferConfig::default());
        buffer.append(&[1, 2, 3, 4]);
        buffer.take_window();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.duration_seconds(), 0.0);
        assert_eq!(buffer.window_duration_seconds(), 0.0);
    }
}
