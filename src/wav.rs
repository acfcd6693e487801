//! WAV packaging for rendered plans.
//!
//! Wraps accumulated raw 16-bit PCM bytes in a standard RIFF/WAVE container
//! (44-byte header followed by the data) via `hound`, entirely in memory.

use anyhow::{Context, Result, ensure};
use std::io::Cursor;

/// Package interleaved 16-bit LE PCM bytes as a complete WAV file.
///
/// The byte length must be a whole number of samples. MIME type of the
/// result is `audio/wav`.
pub fn package_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    ensure!(pcm.len() % 2 == 0, "PCM byte length {} is not sample-aligned", pcm.len());
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("failed to start WAV writer")?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV header")?;
    }
    Ok(cursor.into_inner())
}
