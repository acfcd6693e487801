//! PCM decoding for received audio chunks.
//!
//! The service sends base64-encoded interleaved 16-bit LE PCM. This module
//! turns that into de-interleaved normalized f32 channel buffers ready for
//! the output sink. Pure and stateless.

use anyhow::{Context, Result};

/// Decoded audio: one normalized f32 buffer per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioData {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Decode a base64 chunk payload into raw bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    data_encoding::BASE64
        .decode(data.as_bytes())
        .context("invalid base64 audio payload")
}

/// De-interleave 16-bit LE PCM into normalized f32 channel buffers.
///
/// Frame count is `bytes.len() / 2 / num_channels` — a trailing partial
/// frame is truncated. Samples are divided by 32768.0, so the output range
/// is [-1.0, 1.0) and +1.0 is never produced.
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, num_channels: usize) -> AudioData {
    assert!(num_channels > 0, "num_channels must be nonzero");
    let frames = bytes.len() / 2 / num_channels;
    let mut channels = vec![Vec::with_capacity(frames); num_channels];
    for frame in 0..frames {
        for (ch, buf) in channels.iter_mut().enumerate() {
            let i = (frame * num_channels + ch) * 2;
            let sample = i16::from_le_bytes([bytes[i], bytes[i + 1]]);
            buf.push(sample as f32 / 32768.0);
        }
    }
    AudioData { channels, sample_rate }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_i16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn base64_round_trip() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let encoded = data_encoding::BASE64.encode(&bytes);
        assert_eq!(decode_base64(&encoded).unwrap(), bytes);
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(decode_base64("not!!valid!!base64").is_err());
    }

    #[test]
    fn deinterleaves_stereo() {
        // L0 R0 L1 R1
        let bytes = encode_i16(&[100, -100, 200, -200]);
        let audio = decode_audio_data(&bytes, 48_000, 2);
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.channels[0], vec![100.0 / 32768.0, 200.0 / 32768.0]);
        assert_eq!(audio.channels[1], vec![-100.0 / 32768.0, -200.0 / 32768.0]);
    }

    #[test]
    fn normalization_range_is_half_open() {
        let bytes = encode_i16(&[i16::MIN, i16::MAX]);
        let audio = decode_audio_data(&bytes, 48_000, 1);
        assert_eq!(audio.channels[0][0], -1.0);
        assert!(audio.channels[0][1] < 1.0);
        assert!(audio.channels[0][1] > 0.9999);
    }

    #[test]
    fn frame_count_matches_len_over_two_over_channels() {
        for (len, channels, expected) in [(16, 2, 4), (16, 1, 8), (18, 4, 2)] {
            let bytes = vec![0u8; len];
            let audio = decode_audio_data(&bytes, 48_000, channels);
            assert_eq!(audio.frames(), expected, "len={len} ch={channels}");
        }
    }

    #[test]
    fn trailing_partial_frame_is_truncated() {
        // 5 bytes, stereo: one full frame (4 bytes) plus a dangling byte.
        let mut bytes = encode_i16(&[1, 2]);
        bytes.push(0xAB);
        let audio = decode_audio_data(&bytes, 48_000, 2);
        assert_eq!(audio.frames(), 1);
    }

    #[test]
    fn round_trip_within_one_lsb() {
        let original: Vec<f32> = vec![-1.0, -0.5, 0.0, 0.25, 0.9999];
        let quantized: Vec<i16> = original
            .iter()
            .map(|&s| ((s * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32)) as i16)
            .collect();
        let audio = decode_audio_data(&encode_i16(&quantized), 48_000, 1);
        for (a, b) in original.iter().zip(&audio.channels[0]) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} vs {b}");
        }
    }

    #[test]
    fn duration_follows_sample_rate() {
        let bytes = vec![0u8; 48_000 * 2 * 2]; // 1 second of stereo
        let audio = decode_audio_data(&bytes, 48_000, 2);
        assert!((audio.duration() - 1.0).abs() < 1e-9);
    }
}
