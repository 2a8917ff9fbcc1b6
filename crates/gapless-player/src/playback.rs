//! CPAL-backed [`AudioSink`].
//!
//! PCM submitted by the player is converted to `f32` and pushed into a bounded device
//! queue. The CPAL callback drains that queue without blocking:
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts to the device sample format
//! - raises the sink's ready flag once a whole chunk fits in the queue again

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use cpal::traits::{DeviceTrait, StreamTrait};
use gapless_types::PcmFormat;

use crate::device;
use crate::sink::{AudioSink, SinkReady};

/// Interleaved samples waiting for the output callback.
struct DeviceQueue {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    underruns: AtomicU64,
}

impl DeviceQueue {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            underruns: AtomicU64::new(0),
        }
    }

    fn clear(&self) {
        if let Ok(mut q) = self.samples.lock() {
            q.clear();
        }
    }
}

/// Audio sink playing through a CPAL output stream.
pub struct CpalSink {
    device: cpal::Device,
    /// Samples (not bytes) in one player chunk.
    chunk_samples: usize,
    ready: SinkReady,
    queue: Arc<DeviceQueue>,
    stream: Option<cpal::Stream>,
    format: Option<PcmFormat>,
}

impl CpalSink {
    /// `chunk_bytes` must match the player's chunk size so a signalled chunk always fits.
    pub fn new(device: cpal::Device, chunk_bytes: usize) -> Self {
        // 16-bit PCM: two bytes per sample.
        let chunk_samples = (chunk_bytes / 2).max(1);
        Self {
            device,
            chunk_samples,
            ready: SinkReady::new(),
            queue: Arc::new(DeviceQueue::new(chunk_samples * 2)),
            stream: None,
            format: None,
        }
    }

    /// Samples the callback had to replace with silence since the last configure.
    pub fn underruns(&self) -> u64 {
        self.queue.underruns.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn configure(&mut self, format: PcmFormat) -> Result<()> {
        if format.bits_per_sample != 16 {
            bail!("unsupported sample width {} bits", format.bits_per_sample);
        }
        self.deinit();

        let config = device::pick_output_config(&self.device, format.sample_rate, format.channels)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }
        tracing::info!(
            format = %format,
            device_channels = stream_config.channels,
            sample_format = ?config.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            "configuring output"
        );

        let stream = build_output_stream(
            &self.device,
            &stream_config,
            config.sample_format(),
            usize::from(format.channels),
            self.chunk_samples,
            self.queue.clone(),
            self.ready.clone(),
        )?;
        stream.play()?;
        self.queue.underruns.store(0, Ordering::Relaxed);
        self.stream = Some(stream);
        self.format = Some(format);
        self.ready.set();
        Ok(())
    }

    fn format(&self) -> Option<PcmFormat> {
        self.format
    }

    fn ready(&self) -> SinkReady {
        self.ready.clone()
    }

    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        if self.stream.is_none() {
            bail!("output written before configure");
        }
        let mut q = self
            .queue
            .samples
            .lock()
            .map_err(|_| anyhow!("device queue poisoned"))?;
        let room = self.queue.capacity.saturating_sub(q.len());
        let samples = pcm.len() / 2;
        if samples > room {
            tracing::warn!(samples, room, "device queue overfilled");
        }
        q.extend(
            pcm.chunks_exact(2)
                .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32_768.0),
        );
        Ok(())
    }

    fn drained(&self) -> bool {
        self.stream.is_none()
            || self
                .queue
                .samples
                .lock()
                .map(|q| q.is_empty())
                .unwrap_or(true)
    }

    fn deinit(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("output stream closed");
        }
        self.queue.clear();
        self.format = None;
        self.ready.clear();
    }
}

/// Build a CPAL output stream draining `queue`, for any supported device sample format.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    src_channels: usize,
    chunk_samples: usize,
    queue: Arc<DeviceQueue>,
    ready: SinkReady,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(device, config, src_channels, chunk_samples, queue, ready)
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(device, config, src_channels, chunk_samples, queue, ready)
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(device, config, src_channels, chunk_samples, queue, ready)
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(device, config, src_channels, chunk_samples, queue, ready)
        }
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    src_channels: usize,
    chunk_samples: usize,
    queue: Arc<DeviceQueue>,
    ready: SinkReady,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = usize::from(config.channels).max(1);
    let src_channels = src_channels.max(1);
    let mut frame = vec![0.0f32; src_channels];

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            let Ok(mut q) = queue.samples.lock() else {
                data.fill(silence);
                return;
            };
            let frames = data.len() / dst_channels;
            for i in 0..frames {
                let start = i * dst_channels;
                if q.len() < src_channels {
                    data[start..].fill(silence);
                    queue
                        .underruns
                        .fetch_add((data.len() - start) as u64, Ordering::Relaxed);
                    break;
                }
                for slot in frame.iter_mut() {
                    *slot = q.pop_front().unwrap_or(0.0);
                }
                for ch in 0..dst_channels {
                    data[start + ch] = <T as cpal::Sample>::from_sample::<f32>(map_channel(
                        &frame,
                        dst_channels,
                        ch,
                    ));
                }
            }
            if queue.capacity.saturating_sub(q.len()) >= chunk_samples {
                ready.set();
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Output sample for `dst_ch` from one source frame.
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - same layout: pass-through
/// - other layouts: clamp to the last available source channel
fn map_channel(frame: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    match (frame.len(), dst_channels) {
        (2, 1) => 0.5 * (frame[0] + frame[1]),
        (n, _) if n > 0 => frame[dst_ch.min(n - 1)],
        _ => 0.0,
    }
}
