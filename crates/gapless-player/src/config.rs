use std::time::Duration;

use anyhow::{Result, bail};

/// Sizing and timing parameters for the streaming pipeline.
///
/// All buffers are allocated once from these values when the pipeline is built.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity of the compressed input ring (network -> decoder).
    pub in_buffer_bytes: usize,
    /// Staging area in front of the input ring; the decoder always sees at least this many
    /// contiguous bytes when that many are buffered.
    pub contiguous_bytes: usize,
    /// Capacity of the PCM ring (decoder -> player).
    pub out_buffer_bytes: usize,
    /// Scratch size for a single non-blocking socket read.
    pub read_chunk_bytes: usize,
    /// Upper bound on PCM bytes submitted to the sink per write.
    pub play_chunk_bytes: usize,
    /// Largest PCM output of one codec decode call.
    pub max_decode_unit_bytes: usize,
    /// Time box for the decoder's hot loop per tick.
    pub decode_budget: Duration,
    /// Input bytes required before the decoder is started on a track.
    pub min_decode_start_bytes: usize,
    /// Bytes fed to the codec before it is asked to find sync.
    pub sync_probe_bytes: usize,
    /// Decoded audio required before the player (re)starts.
    pub min_backlog: Duration,
    /// Ticks the reader waits before opening a connection.
    pub connect_settle_ticks: u32,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Consecutive failed reconnects tolerated before a track is given up.
    pub max_resume_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            in_buffer_bytes: 160 * 1024,
            contiguous_bytes: 2 * 1024,
            out_buffer_bytes: 700 * 1024,
            read_chunk_bytes: 16 * 1024,
            play_chunk_bytes: 64 * 1024,
            max_decode_unit_bytes: 8 * 1024,
            decode_budget: Duration::from_millis(10),
            min_decode_start_bytes: 4 * 1024,
            sync_probe_bytes: 512,
            min_backlog: Duration::from_secs(1),
            connect_settle_ticks: 5,
            connect_timeout: Duration::from_secs(5),
            max_resume_attempts: 5,
        }
    }
}

impl PipelineConfig {
    /// Reject sizes the pipeline cannot make progress with.
    ///
    /// The decoder only runs while the PCM ring has room for a whole decode unit, so the
    /// ring must hold at least two of them.
    pub fn validate(&self) -> Result<()> {
        if self.in_buffer_bytes == 0 {
            bail!("input buffer size must be non-zero");
        }
        if self.max_decode_unit_bytes == 0 || self.play_chunk_bytes == 0 {
            bail!("decode unit and play chunk sizes must be non-zero");
        }
        if self.out_buffer_bytes < 2 * self.max_decode_unit_bytes {
            bail!(
                "output buffer of {} bytes cannot hold two decode units of {} bytes",
                self.out_buffer_bytes,
                self.max_decode_unit_bytes
            );
        }
        Ok(())
    }

    /// PCM bytes the player needs buffered before it starts, for a given byte rate.
    ///
    /// Capped so the threshold stays reachable while the decoder keeps one decode unit free.
    pub fn backlog_bytes(&self, bytes_per_second: usize) -> usize {
        let wanted = (bytes_per_second as f64 * self.min_backlog.as_secs_f64()) as usize;
        let reachable = self
            .out_buffer_bytes
            .saturating_sub(2 * self.max_decode_unit_bytes);
        wanted.min(reachable).max(1)
    }
}
