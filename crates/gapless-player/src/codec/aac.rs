//! AAC codec over ADTS framing, decoded with Symphonia.
//!
//! The transport demultiplexer (or a raw `.aac` stream) delivers ADTS frames. This codec
//! finds the first frame header, derives the stream parameters from it, and hands each
//! frame's raw payload to Symphonia's AAC decoder as one packet.

use anyhow::{Context, Result, bail};
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use super::{Codec, DecodeStatus, StreamInfo, SyncSearch};

/// Sampling frequencies indexed by the ADTS `sampling_frequency_index`.
const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

/// PCM frames per AAC-LC access unit.
const SAMPLES_PER_FRAME: u64 = 1024;

/// Bytes needed to read a header without CRC.
const MIN_HEADER_LEN: usize = 7;

/// Default input buffer: room for two maximum-size ADTS frames.
const INPUT_CAPACITY: usize = 16 * 1024;

/// Fields of an ADTS frame header the decoder needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type minus one.
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// 7, or 9 when a CRC follows the header.
    pub header_len: usize,
    /// Whole frame length, header included.
    pub frame_len: usize,
}

impl AdtsHeader {
    /// Parse a header at the start of `data`; `None` if it is not a valid ADTS header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_HEADER_LEN || !is_sync(data) {
            return None;
        }
        // Layer must be zero.
        if data[1] & 0x06 != 0 {
            return None;
        }
        let header_len = if data[1] & 0x01 != 0 { 7 } else { 9 };
        let profile = (data[2] >> 6) & 0x03;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_len = (usize::from(data[3] & 0x03) << 11)
            | (usize::from(data[4]) << 3)
            | usize::from(data[5] >> 5);
        if usize::from(sample_rate_index) >= SAMPLE_RATES.len() || frame_len <= header_len {
            return None;
        }
        Some(Self {
            profile,
            sample_rate_index,
            channel_config,
            header_len,
            frame_len,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[usize::from(self.sample_rate_index)]
    }

    /// Two-byte MPEG-4 AudioSpecificConfig equivalent to this header.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let object_type = self.profile + 1;
        [
            (object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }
}

fn is_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}

/// ADTS AAC decoder with its own input buffer.
pub struct AacCodec {
    input: Vec<u8>,
    pos: usize,
    capacity: usize,
    header: Option<AdtsHeader>,
    decoder: Option<Box<dyn Decoder>>,
}

impl Default for AacCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AacCodec {
    pub fn new() -> Self {
        Self::with_capacity(INPUT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            input: Vec::with_capacity(capacity),
            pos: 0,
            capacity,
            header: None,
            decoder: None,
        }
    }

    fn pending(&self) -> &[u8] {
        &self.input[self.pos..]
    }

    /// Offset of the first plausible frame header in `data`.
    ///
    /// When the following frame is already buffered its sync word must be present too.
    fn find_frame(data: &[u8]) -> Option<usize> {
        (0..data.len()).find(|&i| match AdtsHeader::parse(&data[i..]) {
            Some(h) => match data.get(i + h.frame_len..) {
                Some(next) if next.len() >= 2 => is_sync(next),
                _ => true,
            },
            None => false,
        })
    }

    fn make_decoder(header: &AdtsHeader) -> Result<Box<dyn Decoder>> {
        let channels = match header.channel_config {
            1 => Channels::FRONT_CENTRE,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            other => bail!("unsupported AAC channel configuration {other}"),
        };
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(header.sample_rate())
            .with_channels(channels)
            .with_extra_data(header.audio_specific_config().to_vec().into_boxed_slice());
        symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create AAC decoder")
    }
}

impl Codec for AacCodec {
    fn init(&mut self) -> Result<()> {
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        self.input.clear();
        self.pos = 0;
        self.header = None;
        self.decoder = None;
    }

    fn write_free(&self) -> usize {
        self.capacity - self.pending().len()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.pos > 0 {
            self.input.drain(..self.pos);
            self.pos = 0;
        }
        let n = data.len().min(self.write_free());
        self.input.extend_from_slice(&data[..n]);
        n
    }

    fn buffered(&self) -> usize {
        self.pending().len()
    }

    fn start(&mut self) -> SyncSearch {
        let pending = self.pending();
        let Some(offset) = Self::find_frame(pending) else {
            // Keep a partial header that may complete with the next write.
            let skipped = pending.len().saturating_sub(MIN_HEADER_LEN - 1);
            self.pos += skipped;
            return SyncSearch::NotFound { skipped };
        };
        let header = AdtsHeader::parse(&pending[offset..]);
        self.pos += offset;
        let Some(header) = header else {
            return SyncSearch::NotFound { skipped: offset };
        };
        match Self::make_decoder(&header) {
            Ok(decoder) => {
                tracing::debug!(
                    sample_rate = header.sample_rate(),
                    channels = header.channel_config,
                    profile = header.profile,
                    skipped = offset,
                    "adts sync"
                );
                self.header = Some(header);
                self.decoder = Some(decoder);
                SyncSearch::Found { skipped: offset }
            }
            Err(e) => {
                tracing::warn!("{e:#}");
                // Step past this header so the next search looks further on.
                self.pos += 1;
                SyncSearch::NotFound { skipped: offset + 1 }
            }
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        let header = self.header.as_ref()?;
        let sample_rate = header.sample_rate();
        let bitrate = (header.frame_len as u64 * 8 * u64::from(sample_rate) / SAMPLES_PER_FRAME)
            .try_into()
            .ok();
        Some(StreamInfo {
            channels: u16::from(header.channel_config),
            sample_rate,
            bits_per_sample: 16,
            bitrate,
        })
    }

    fn decode(&mut self, out: &mut [u8]) -> DecodeStatus {
        let Some(decoder) = self.decoder.as_mut() else {
            return DecodeStatus::Corrupt;
        };
        let data = &self.input[self.pos..];
        if data.len() < MIN_HEADER_LEN {
            return DecodeStatus::NeedMoreData { bytes_consumed: 0 };
        }
        let Some(header) = AdtsHeader::parse(data) else {
            // Lost sync: drop bytes up to the next candidate header.
            let skip = Self::find_frame(&data[1..])
                .map(|i| i + 1)
                .unwrap_or_else(|| data.len().saturating_sub(MIN_HEADER_LEN - 1).max(1));
            self.pos += skip;
            return DecodeStatus::ContinuedPacket {
                bytes_consumed: skip,
            };
        };
        if data.len() < header.frame_len {
            return DecodeStatus::NeedMoreData { bytes_consumed: 0 };
        }

        let packet = Packet::new_from_slice(
            0,
            0,
            SAMPLES_PER_FRAME,
            &data[header.header_len..header.frame_len],
        );
        let status = match decoder.decode(&packet) {
            Ok(decoded) => {
                let mut sample_buf =
                    SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
                sample_buf.copy_interleaved_ref(decoded);
                let samples = sample_buf.samples();
                if samples.len() * 2 > out.len() {
                    tracing::warn!(
                        samples = samples.len(),
                        room = out.len(),
                        "aac frame larger than decode unit"
                    );
                    DecodeStatus::Corrupt
                } else {
                    for (dst, s) in out.chunks_exact_mut(2).zip(samples) {
                        dst.copy_from_slice(&s.to_le_bytes());
                    }
                    DecodeStatus::Success {
                        bytes_consumed: header.frame_len,
                        samples_produced: samples.len(),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "aac frame decode failed");
                DecodeStatus::Corrupt
            }
        };
        self.pos += header.frame_len;
        status
    }
}
