//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config that matches the decoded sample rate

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle.map(str::trim).filter(|n| !n.is_empty()) {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose an output config that runs at exactly `rate` Hz.
///
/// Among ranges that include `rate`, the sample format with the best rank wins and configs
/// with at least `channels` channels are preferred.
pub fn pick_output_config(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query output configs")?
        .collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(bool, u8, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        if rate < range.min_sample_rate() || rate > range.max_sample_rate() {
            continue;
        }
        let enough_channels = range.channels() >= channels;
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_enough, b_rank, _)) => {
                is_better_candidate(enough_channels, rank, *b_enough, *b_rank)
            }
        };
        if replace {
            best = Some((enough_channels, rank, range));
        }
    }

    best.map(|(_, _, range)| range.with_sample_rate(rate))
        .ok_or_else(|| anyhow!("Output device does not support {rate} Hz"))
}

/// Prefer a fixed buffer size if the device advertises one.
///
/// Returns `None` when the device only supports the default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
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

/// Print available output devices to stdout.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(enough: bool, rank: u8, best_enough: bool, best_rank: u8) -> bool {
    if enough != best_enough {
        enough
    } else {
        rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
