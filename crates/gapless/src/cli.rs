use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "gapless", version = VERSION, about = "Gapless streaming player for AAC playlists")]
pub struct Args {
    /// Track URLs (.ts or .aac), played in order after any tracks from --config
    pub urls: Vec<String>,

    /// TOML file with settings and a [[tracks]] playlist
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Volume step, 1 (quietest) to 11 (unity gain)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=11))]
    pub volume: Option<u8>,

    /// Pipeline tick interval in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Decoded audio to buffer before playback starts, in milliseconds
    #[arg(long)]
    pub backlog_ms: Option<u64>,

    /// Do not read playback commands from stdin
    #[arg(long)]
    pub no_console: bool,
}
