//! Codec call contract used by the track decoder.
//!
//! The codec owns a small input buffer that the decoder tops up; each `decode` call turns at
//! most one coded unit into interleaved PCM.

pub mod aac;

use anyhow::Result;
use gapless_types::PcmFormat;

pub use aac::AacCodec;

/// Stream parameters discovered by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Nominal bitrate in bits per second, when the codec knows it.
    pub bitrate: Option<u32>,
}

impl StreamInfo {
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            channels: self.channels,
        }
    }
}

/// Result of scanning buffered input for a frame boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSearch {
    /// Sync located; `skipped` bytes before it were dropped.
    Found { skipped: usize },
    /// No sync in the buffered input; `skipped` bytes were dropped.
    NotFound { skipped: usize },
}

/// Outcome of one `decode` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// One unit decoded into `samples_produced` samples (all channels).
    Success {
        bytes_consumed: usize,
        samples_produced: usize,
    },
    /// Not enough buffered input for the next unit.
    NeedMoreData { bytes_consumed: usize },
    /// Input was consumed (e.g. skipped while resyncing) without producing samples.
    ContinuedPacket { bytes_consumed: usize },
    /// The stream is undecodable.
    Corrupt,
    /// The codec saw the end of the stream.
    Done,
}

/// Incremental decoder driven by the track decoder.
pub trait Codec {
    /// Prepare for a new stream. Called at every track start after `close`.
    fn init(&mut self) -> Result<()>;

    /// Drop all stream state and buffered input.
    fn close(&mut self);

    /// Free space in the codec's input buffer.
    fn write_free(&self) -> usize;

    /// Append input; returns bytes accepted (at most `write_free()`).
    fn write(&mut self, data: &[u8]) -> usize;

    /// Input bytes buffered and not yet consumed.
    fn buffered(&self) -> usize;

    /// Scan buffered input for the first frame boundary.
    ///
    /// On `NotFound` the scanned bytes must be dropped, apart from a tail that could still
    /// begin a header; a codec whose input stays full without sync has its track abandoned.
    fn start(&mut self) -> SyncSearch;

    /// Stream parameters, once known.
    fn stream_info(&self) -> Option<StreamInfo>;

    /// Decode at most one unit into `out` as little-endian interleaved PCM.
    fn decode(&mut self, out: &mut [u8]) -> DecodeStatus;
}
