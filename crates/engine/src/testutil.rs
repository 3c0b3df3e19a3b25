//! Shared fixtures for the in-crate tests.

use std::path::Path;

use anyhow::Result;

/// Write a 16-bit PCM WAV with a quiet sine tone.
pub(crate) fn write_test_wav(path: &Path, frames: usize, rate: u32, channels: u16) -> Result<()> {
    let block_align = channels * 2;
    let byte_rate = rate * block_align as u32;
    let data_len = frames * block_align as usize;

    let mut out = Vec::with_capacity(44 + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for i in 0..frames {
        let sample = ((i as f32 * 0.05).sin() * 8_000.0) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }

    std::fs::write(path, out)?;
    Ok(())
}
