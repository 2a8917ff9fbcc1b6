//! Gapless: play a playlist of AAC tracks streamed over HTTP back to back, without gaps.
//!
//! Tracks are read over HTTP or HTTPS, decoded from MPEG-TS or raw ADTS, and played through CPAL.
//! A single thread ticks the reader, decoder, and player in turn; an optional console thread
//! forwards transport commands typed on stdin.

mod cli;
mod config;
mod events;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,gapless=info,gapless_player=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        gapless_player::device::list_devices(&host)?;
        return Ok(());
    }

    let file = match args.config.as_deref() {
        Some(path) => config::FileConfig::load(path)?,
        None => config::FileConfig::default(),
    };
    let settings = config::Settings::resolve(&args, file)?;
    runtime::run(settings)
}
