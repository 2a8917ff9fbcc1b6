//! Audio sink contract and the ready flag shared with the output callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use gapless_types::PcmFormat;

/// "Ready for more data" signal raised from the audio callback.
///
/// The callback only ever sets it; the player consumes it right before submitting a chunk.
#[derive(Clone, Debug, Default)]
pub struct SinkReady(Arc<AtomicBool>);

impl SinkReady {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the flag; `true` if it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Asynchronous PCM output device.
pub trait AudioSink {
    /// (Re)initialise for `format`. Drops anything still queued for the old format.
    fn configure(&mut self, format: PcmFormat) -> Result<()>;

    /// Format the sink is currently configured for.
    fn format(&self) -> Option<PcmFormat>;

    /// Handle to the ready flag. Set once configured and whenever a chunk fits again.
    fn ready(&self) -> SinkReady;

    /// Queue PCM for playback; returns immediately.
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Everything written so far has been handed to the device.
    ///
    /// The player waits for this before closing the sink or reconfiguring it.
    fn drained(&self) -> bool;

    /// Release the device. Safe to call when not configured.
    fn deinit(&mut self);
}

/// Lowest and highest volume steps.
pub const MIN_VOLUME: u8 = 1;
pub const MAX_VOLUME: u8 = 11;

/// Attenuation in bits for a volume step: 11 is unity, each step below halves the amplitude.
pub fn volume_shift(volume: u8) -> u32 {
    u32::from(MAX_VOLUME.saturating_sub(volume.clamp(MIN_VOLUME, MAX_VOLUME)))
}

/// Scale little-endian PCM in place by an arithmetic right shift.
pub fn apply_gain(pcm: &mut [u8], bits_per_sample: u16, shift: u32) {
    if shift == 0 {
        return;
    }
    match bits_per_sample {
        16 => {
            for s in pcm.chunks_exact_mut(2) {
                let v = i16::from_le_bytes([s[0], s[1]]) >> shift;
                s.copy_from_slice(&v.to_le_bytes());
            }
        }
        32 => {
            for s in pcm.chunks_exact_mut(4) {
                let v = i32::from_le_bytes([s[0], s[1], s[2], s[3]]) >> shift;
                s.copy_from_slice(&v.to_le_bytes());
            }
        }
        other => tracing::warn!(bits = other, "gain not supported for sample width"),
    }
}
