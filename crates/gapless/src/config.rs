//! Configuration loading and parsing.
//!
//! An optional TOML file supplies player settings, pipeline tuning, and a playlist; command
//! line arguments override it.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gapless_player::config::PipelineConfig;
use serde::Deserialize;

use crate::cli::Args;

const DEFAULT_TICK_MS: u64 = 10;

/// Top-level config file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Output device substring.
    pub device: Option<String>,
    /// Volume step (1..=11).
    pub volume: Option<u8>,
    /// Tick interval in milliseconds.
    pub tick_ms: Option<u64>,
    pub pipeline: Option<PipelineSection>,
    pub tracks: Option<Vec<TrackConfig>>,
}

/// Overrides for [`PipelineConfig`]. Sizes are in KiB.
#[derive(Debug, Default, Deserialize)]
pub struct PipelineSection {
    pub in_buffer_kib: Option<usize>,
    pub out_buffer_kib: Option<usize>,
    pub play_chunk_kib: Option<usize>,
    pub min_backlog_ms: Option<u64>,
    pub decode_budget_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub connect_settle_ticks: Option<u32>,
    pub max_resume_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TrackConfig {
    pub url: String,
    pub title: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {path:?}"))?;
        toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {path:?}"))
    }
}

impl PipelineSection {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(kib) = self.in_buffer_kib {
            cfg.in_buffer_bytes = kib * 1024;
        }
        if let Some(kib) = self.out_buffer_kib {
            cfg.out_buffer_bytes = kib * 1024;
        }
        if let Some(kib) = self.play_chunk_kib {
            cfg.play_chunk_bytes = kib * 1024;
        }
        if let Some(ms) = self.min_backlog_ms {
            cfg.min_backlog = Duration::from_millis(ms);
        }
        if let Some(ms) = self.decode_budget_ms {
            cfg.decode_budget = Duration::from_millis(ms);
        }
        if let Some(secs) = self.connect_timeout_secs {
            cfg.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ticks) = self.connect_settle_ticks {
            cfg.connect_settle_ticks = ticks;
        }
        if let Some(n) = self.max_resume_attempts {
            cfg.max_resume_attempts = n;
        }
    }
}

/// One playlist slot after merging file and command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub url: String,
}

/// Everything the runtime needs.
#[derive(Debug)]
pub struct Settings {
    pub device: Option<String>,
    pub volume: u8,
    pub tick: Duration,
    pub console: bool,
    pub pipeline: PipelineConfig,
    pub tracks: Vec<Track>,
}

impl Settings {
    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
        let mut pipeline = PipelineConfig::default();
        if let Some(section) = file.pipeline.as_ref() {
            section.apply(&mut pipeline);
        }
        if let Some(ms) = args.backlog_ms {
            pipeline.min_backlog = Duration::from_millis(ms);
        }
        pipeline.validate().context("invalid [pipeline] settings")?;

        let volume = args.volume.or(file.volume).unwrap_or(11);
        if !(1..=11).contains(&volume) {
            bail!("volume {volume} out of range 1..=11");
        }

        let mut tracks: Vec<Track> = file
            .tracks
            .unwrap_or_default()
            .into_iter()
            .map(|t| Track {
                title: t.title.unwrap_or_else(|| title_from_url(&t.url)),
                url: t.url,
            })
            .collect();
        tracks.extend(args.urls.iter().map(|url| Track {
            title: title_from_url(url),
            url: url.clone(),
        }));

        Ok(Self {
            device: normalize_device_name(args.device.clone().or(file.device)),
            volume,
            tick: Duration::from_millis(args.tick_ms.or(file.tick_ms).unwrap_or(DEFAULT_TICK_MS).max(1)),
            console: !args.no_console,
            pipeline,
            tracks,
        })
    }
}

/// Last path segment of a URL without query or extension.
pub fn title_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    if stem.is_empty() {
        url.to_string()
    } else {
        stem.replace("%20", " ")
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
