pub mod codec;
pub mod config;
pub mod decoder;
pub mod demux;
pub mod device;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod playback;
pub mod player;
pub mod reader;
pub mod ring;
pub mod sink;
pub mod track;

#[cfg(test)]
mod test_support;

pub use pipeline::{AudioPlayer, PlayerEvents};
