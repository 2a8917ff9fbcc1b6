//! Track decoder: turns compressed input from the input ring into PCM in the output ring.
//!
//! Per track: reset the codec, feed it a small probe and look for sync, wait for stream info
//! (which queues the track for the player), then decode until the track's declared input is
//! used up. Each pump runs a loop bounded by a wall-clock budget and returns early when the
//! output ring cannot take another decode unit or the input runs dry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use gapless_types::{ContainerFormat, DecodeBreak, DecoderPhase, PcmFormat, TrackEvent};

use crate::codec::{Codec, DecodeStatus, SyncSearch};
use crate::config::PipelineConfig;
use crate::demux::{PACKET_SIZE, TransportDemuxer};
use crate::player::PlayQueue;
use crate::ring::{OverflowRing, RingBuffer};
use crate::track::{PlayTrack, TrackDescriptor};

struct DecodeTrack {
    desc: TrackDescriptor,
    /// Declared input bytes not yet taken from the input ring.
    input_left: u64,
    /// Bytes handed to the codec so far.
    fed: u64,
    /// Feed at least this much before the next sync attempt.
    probe_until: u64,
    decoded: u64,
    format: Option<PcmFormat>,
}

/// Input still owed by an abandoned track.
struct SkipInput {
    seq: u64,
    length: u64,
    left: u64,
}

#[derive(Default)]
struct TopUp {
    consumed: usize,
    fed: usize,
}

enum Step {
    Continue,
    Yield(DecodeBreak),
}

pub struct TrackDecoder<K: Codec> {
    codec: K,
    phase: DecoderPhase,
    pending: VecDeque<TrackDescriptor>,
    current: Option<DecodeTrack>,
    skipping: Option<SkipInput>,
    demux: TransportDemuxer,
    unit: Box<[u8]>,
    packet_out: [u8; PACKET_SIZE],
    budget: Duration,
    sync_probe: u64,
    started: u64,
    last_break: Option<DecodeBreak>,
}

impl<K: Codec> TrackDecoder<K> {
    pub fn new(codec: K, config: &PipelineConfig) -> Self {
        Self {
            codec,
            phase: DecoderPhase::Idle,
            pending: VecDeque::new(),
            current: None,
            skipping: None,
            demux: TransportDemuxer::new(),
            unit: vec![0u8; config.max_decode_unit_bytes.max(1)].into_boxed_slice(),
            packet_out: [0u8; PACKET_SIZE],
            budget: config.decode_budget,
            sync_probe: config.sync_probe_bytes.max(1) as u64,
            started: 0,
            last_break: None,
        }
    }

    /// Queue a track whose input will follow in the input ring.
    pub fn add_to_decode_list(&mut self, desc: TrackDescriptor) {
        tracing::debug!(tag = %desc.tag, length = desc.length, "queued for decoding");
        self.pending.push_back(desc);
    }

    /// Shrink track `seq` to `length` input bytes after the reader gave up on it.
    pub fn truncate(&mut self, seq: u64, length: u64) {
        if let Some(track) = self.current.as_mut().filter(|t| t.desc.seq == seq) {
            let removed = track.desc.length.saturating_sub(length);
            track.desc.length = length;
            track.input_left = track.input_left.saturating_sub(removed);
        } else if let Some(skip) = self.skipping.as_mut().filter(|s| s.seq == seq) {
            let removed = skip.length.saturating_sub(length);
            skip.length = length;
            skip.left = skip.left.saturating_sub(removed);
        } else if let Some(desc) = self.pending.iter_mut().find(|d| d.seq == seq) {
            desc.length = length;
        }
        tracing::debug!(seq, length, "track input truncated");
    }

    /// Begin decoding the next queued track if idle.
    pub fn start(&mut self) {
        if self.phase == DecoderPhase::Idle && !self.pending.is_empty() {
            self.phase = DecoderPhase::TrackStart;
        }
    }

    pub fn reset(&mut self) {
        self.codec.close();
        self.demux.reset();
        self.pending.clear();
        self.current = None;
        self.skipping = None;
        self.phase = DecoderPhase::Idle;
        self.started = 0;
        self.last_break = None;
    }

    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == DecoderPhase::Idle
    }

    /// Idle with nothing queued.
    pub fn is_done(&self) -> bool {
        self.phase == DecoderPhase::Idle && self.pending.is_empty() && self.current.is_none()
    }

    /// Input length of the track that would start next.
    pub fn next_input_len(&self) -> Option<u64> {
        self.pending.front().map(|d| d.length)
    }

    /// Tracks started since the last reset.
    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn last_break(&self) -> Option<DecodeBreak> {
        self.last_break
    }

    /// Run the decode loop until it must yield or the time budget runs out.
    ///
    /// Only codec initialisation failures are returned as errors; bad input abandons the
    /// track instead.
    pub fn pump(
        &mut self,
        in_buf: &mut OverflowRing,
        out_buf: &mut RingBuffer,
        plays: &mut PlayQueue,
        events: &mut Vec<TrackEvent>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.budget;
        loop {
            let step = match self.phase {
                DecoderPhase::Idle => Step::Yield(DecodeBreak::NoTrack),
                DecoderPhase::TrackStart => self.start_track(in_buf, plays, events)?,
                DecoderPhase::Skipping => self.skip_input(in_buf),
                DecoderPhase::ReadInfo | DecoderPhase::Decoding => {
                    self.decode_step(in_buf, out_buf, plays, events)
                }
            };
            match step {
                Step::Yield(reason) => {
                    self.last_break = Some(reason);
                    return Ok(());
                }
                Step::Continue if Instant::now() >= deadline => {
                    self.last_break = Some(DecodeBreak::Timeout);
                    return Ok(());
                }
                Step::Continue => {}
            }
        }
    }

    fn start_track(
        &mut self,
        in_buf: &mut OverflowRing,
        plays: &mut PlayQueue,
        events: &mut Vec<TrackEvent>,
    ) -> Result<Step> {
        if self.current.is_none() {
            let Some(desc) = self.pending.pop_front() else {
                self.phase = DecoderPhase::Idle;
                return Ok(Step::Yield(DecodeBreak::NoTrack));
            };
            self.codec.close();
            self.codec.init()?;
            self.demux.reset();
            self.started += 1;
            tracing::debug!(tag = %desc.tag, container = desc.container.label(), "decoder starting track");
            events.push(TrackEvent::DecodeStarted {
                tag: desc.tag.clone(),
            });
            self.current = Some(DecodeTrack {
                input_left: desc.length,
                desc,
                fed: 0,
                probe_until: self.sync_probe,
                decoded: 0,
                format: None,
            });
        }

        loop {
            let Some(track) = self.current.as_ref() else {
                return Ok(Step::Continue);
            };
            if track.fed >= track.probe_until || track.input_left == 0 {
                break;
            }
            match self.top_up(in_buf) {
                Ok(t) if t.consumed == 0 => {
                    if self.codec_full() {
                        break;
                    }
                    return Ok(Step::Yield(DecodeBreak::InputStarved));
                }
                Ok(_) => {}
                Err(e) => return Ok(self.abandon(format!("{e:#}"), plays, events)),
            }
        }

        match self.codec.start() {
            SyncSearch::Found { skipped } => {
                tracing::trace!(skipped, "codec in sync");
                self.phase = DecoderPhase::ReadInfo;
                Ok(Step::Continue)
            }
            SyncSearch::NotFound { .. } => {
                let Some(input_left) = self.current.as_ref().map(|t| t.input_left) else {
                    return Ok(Step::Continue);
                };
                if input_left == 0 {
                    return Ok(self.abandon("no sync found".into(), plays, events));
                }
                if self.codec_full() {
                    return Ok(self.abandon("codec input full without sync".into(), plays, events));
                }
                if let Some(track) = self.current.as_mut() {
                    track.probe_until = track.fed + self.sync_probe;
                }
                Ok(Step::Continue)
            }
        }
    }

    fn decode_step(
        &mut self,
        in_buf: &mut OverflowRing,
        out_buf: &mut RingBuffer,
        plays: &mut PlayQueue,
        events: &mut Vec<TrackEvent>,
    ) -> Step {
        if out_buf.write_available() < self.unit.len() {
            return Step::Yield(DecodeBreak::OutBufferFull);
        }
        let topped = match self.top_up(in_buf) {
            Ok(t) => t,
            Err(e) => return self.abandon(format!("{e:#}"), plays, events),
        };
        self.publish_format(plays);

        let Some(track) = self.current.as_ref() else {
            return Step::Continue;
        };
        let input_done = track.input_left == 0;
        if self.codec.buffered() == 0 {
            return if input_done {
                self.finish(plays, events)
            } else {
                Step::Yield(DecodeBreak::InputStarved)
            };
        }

        match self.codec.decode(&mut self.unit) {
            DecodeStatus::Success {
                samples_produced, ..
            } => {
                self.publish_format(plays);
                let Some(track) = self.current.as_mut() else {
                    return Step::Continue;
                };
                let Some(format) = track.format else {
                    tracing::trace!(samples_produced, "dropping output decoded before stream info");
                    return Step::Continue;
                };
                let bytes = (samples_produced * format.bytes_per_sample())
                    .min(self.unit.len());
                out_buf.write(&self.unit[..bytes]);
                track.decoded += bytes as u64;
                Step::Continue
            }
            DecodeStatus::NeedMoreData { .. } => {
                if input_done {
                    self.finish(plays, events)
                } else if self.codec_full() {
                    self.abandon("codec input full without a complete frame".into(), plays, events)
                } else if topped.consumed == 0 {
                    Step::Yield(DecodeBreak::InputStarved)
                } else {
                    Step::Continue
                }
            }
            DecodeStatus::ContinuedPacket { .. } => Step::Continue,
            DecodeStatus::Corrupt => self.abandon("corrupt stream".into(), plays, events),
            DecodeStatus::Done => self.finish(plays, events),
        }
    }

    /// The codec cannot take another top-up step for the current track.
    fn codec_full(&self) -> bool {
        let step = match self.current.as_ref().map(|t| t.desc.container) {
            Some(ContainerFormat::Transport) => PACKET_SIZE,
            _ => 1,
        };
        self.codec.write_free() < step
    }

    /// Queue the current track for the player as soon as the codec knows its format.
    fn publish_format(&mut self, plays: &mut PlayQueue) {
        let Some(track) = self.current.as_mut() else {
            return;
        };
        if track.format.is_some() {
            return;
        }
        let Some(info) = self.codec.stream_info() else {
            return;
        };
        let format = info.pcm_format();
        tracing::info!(
            tag = %track.desc.tag,
            format = %format,
            bitrate = ?info.bitrate,
            "stream info"
        );
        track.format = Some(format);
        plays.push(PlayTrack {
            seq: track.desc.seq,
            tag: track.desc.tag.clone(),
            format,
            decoded_len: None,
        });
        self.phase = DecoderPhase::Decoding;
    }

    /// Move input from the ring into the codec, demultiplexing transport streams.
    fn top_up(&mut self, in_buf: &mut OverflowRing) -> Result<TopUp> {
        let Some(track) = self.current.as_mut() else {
            return Ok(TopUp::default());
        };
        let mut done = TopUp::default();
        match track.desc.container {
            ContainerFormat::Adts => {
                let left = usize::try_from(track.input_left).unwrap_or(usize::MAX);
                let run = in_buf.contiguous();
                let n = run.len().min(left).min(self.codec.write_free());
                if n > 0 {
                    let accepted = self.codec.write(&run[..n]);
                    in_buf.consume(accepted);
                    done.consumed = accepted;
                    done.fed = accepted;
                }
            }
            ContainerFormat::Transport => {
                while track.input_left >= PACKET_SIZE as u64
                    && in_buf.read_available() >= PACKET_SIZE
                    && self.codec.write_free() >= PACKET_SIZE
                {
                    let run = in_buf.contiguous();
                    let n = self.demux.demux(&run[..PACKET_SIZE], &mut self.packet_out)?;
                    in_buf.consume(PACKET_SIZE);
                    track.input_left -= PACKET_SIZE as u64;
                    done.consumed += PACKET_SIZE;
                    let accepted = self.codec.write(&self.packet_out[..n]);
                    done.fed += accepted;
                }
                // Trailing bytes that do not form a whole packet are dropped.
                let tail = usize::try_from(track.input_left).unwrap_or(usize::MAX);
                if track.input_left < PACKET_SIZE as u64 && tail > 0 && in_buf.read_available() >= tail {
                    in_buf.consume(tail);
                    track.input_left = 0;
                    done.consumed += tail;
                }
                track.fed += done.fed as u64;
                return Ok(done);
            }
        }
        track.input_left -= done.consumed as u64;
        track.fed += done.fed as u64;
        Ok(done)
    }

    fn finish(&mut self, plays: &mut PlayQueue, events: &mut Vec<TrackEvent>) -> Step {
        let Some(track) = self.current.take() else {
            return Step::Continue;
        };
        if track.format.is_some() {
            plays.set_decoded_len(track.desc.seq, track.decoded);
        }
        tracing::debug!(tag = %track.desc.tag, decoded = track.decoded, "track decoded");
        events.push(TrackEvent::DecodeFinished {
            tag: track.desc.tag.clone(),
            decoded_bytes: track.decoded,
        });
        self.codec.close();
        self.end_track(&track);
        Step::Yield(DecodeBreak::TrackFinished)
    }

    fn abandon(&mut self, reason: String, plays: &mut PlayQueue, events: &mut Vec<TrackEvent>) -> Step {
        let Some(track) = self.current.take() else {
            return Step::Continue;
        };
        if track.format.is_some() {
            plays.set_decoded_len(track.desc.seq, track.decoded);
        }
        tracing::warn!(tag = %track.desc.tag, %reason, decoded = track.decoded, "abandoning track");
        events.push(TrackEvent::DecodeAbandoned {
            tag: track.desc.tag.clone(),
            reason,
        });
        self.codec.close();
        self.end_track(&track);
        Step::Yield(DecodeBreak::TrackAbandoned)
    }

    fn end_track(&mut self, track: &DecodeTrack) {
        if track.input_left > 0 {
            self.skipping = Some(SkipInput {
                seq: track.desc.seq,
                length: track.desc.length,
                left: track.input_left,
            });
            self.phase = DecoderPhase::Skipping;
        } else {
            self.phase = DecoderPhase::TrackStart;
        }
    }

    fn skip_input(&mut self, in_buf: &mut OverflowRing) -> Step {
        let Some(skip) = self.skipping.as_mut() else {
            self.phase = DecoderPhase::TrackStart;
            return Step::Continue;
        };
        let n = usize::try_from(skip.left)
            .unwrap_or(usize::MAX)
            .min(in_buf.read_available());
        in_buf.consume(n);
        skip.left -= n as u64;
        if skip.left == 0 {
            self.skipping = None;
            self.phase = DecoderPhase::TrackStart;
            Step::Continue
        } else {
            Step::Yield(DecodeBreak::InputStarved)
        }
    }
}
