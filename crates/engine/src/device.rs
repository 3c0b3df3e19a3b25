//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL: pick a device by substring (or the default),
//! choose an output config close to the source sample rate, and prefer a
//! fixed buffer size when the device advertises one.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| name_matches(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the best supported output config for a target sample rate.
///
/// Rates at or below the target are preferred (no upsampling surprises),
/// then higher rates, then friendlier sample formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let best = ranges
        .into_iter()
        .map(|range| {
            let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
            let below = target_rate.map(|t| rate <= t).unwrap_or(true);
            let rank = format_rank(range.sample_format());
            (below, rate, rank, range.with_sample_rate(rate))
        })
        .max_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(b.2.cmp(&a.2))
        })
        .map(|(_, _, _, cfg)| cfg);

    best.ok_or_else(|| anyhow!("No usable output config"))
}

/// Prefer a fixed buffer size when the device reports a range; larger buffers
/// resist underruns, capped so latency stays sane.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Log the available output devices (CLI `devices` command).
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

fn clamp_rate(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max),
        None => max,
    }
}

fn format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn name_matches(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
