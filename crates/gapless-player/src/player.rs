//! Track player: moves decoded PCM from the output ring to the audio sink.
//!
//! The sink is reconfigured only when the next track's format differs from the current one,
//! so consecutive tracks of the same format play back to back without a gap. Each track
//! ends exactly at its decoded length, which the decoder records once it is known. A format
//! change or the end of the playlist waits until the sink has drained what was submitted.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use gapless_types::{PlayerPhase, TrackEvent};

use crate::ring::RingBuffer;
use crate::sink::{AudioSink, apply_gain};
use crate::track::PlayTrack;

/// Tracks with known PCM format, in play order.
#[derive(Debug, Default)]
pub struct PlayQueue {
    tracks: VecDeque<PlayTrack>,
}

impl PlayQueue {
    pub fn push(&mut self, track: PlayTrack) {
        self.tracks.push_back(track);
    }

    pub fn front(&self) -> Option<&PlayTrack> {
        self.tracks.front()
    }

    pub fn pop_front(&mut self) -> Option<PlayTrack> {
        self.tracks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Record the final PCM length of track `seq`. Returns `false` if it is not queued.
    pub fn set_decoded_len(&mut self, seq: u64, len: u64) -> bool {
        match self.tracks.iter_mut().find(|t| t.seq == seq) {
            Some(track) => {
                track.decoded_len = Some(len);
                true
            }
            None => false,
        }
    }
}

pub struct TrackPlayer {
    phase: PlayerPhase,
    chunk: Box<[u8]>,
    /// PCM bytes of the front track already submitted.
    played: u64,
    /// Set when playback stopped for lack of data in the middle of a track.
    starved: bool,
    started: u64,
    starvations: u64,
}

impl TrackPlayer {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            phase: PlayerPhase::Idle,
            chunk: vec![0u8; chunk_bytes.max(1)].into_boxed_slice(),
            played: 0,
            starved: false,
            started: 0,
            starvations: 0,
        }
    }

    pub fn phase(&self) -> PlayerPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == PlayerPhase::Idle
    }

    /// PCM bytes of the front track already played.
    pub fn played(&self) -> u64 {
        self.played
    }

    /// Tracks started since the last reset.
    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn starvations(&self) -> u64 {
        self.starvations
    }

    /// Leave `Idle`: continue a starved track, or start the next one.
    pub fn start(&mut self) {
        if self.phase != PlayerPhase::Idle {
            return;
        }
        self.phase = if self.starved {
            PlayerPhase::Playing
        } else {
            PlayerPhase::Starting
        };
        self.starved = false;
    }

    pub fn reset(&mut self) {
        self.phase = PlayerPhase::Idle;
        self.played = 0;
        self.starved = false;
        self.started = 0;
        self.starvations = 0;
    }

    /// Advance the player. `upstream_done` means no more PCM or tracks will arrive.
    pub fn pump<S: AudioSink>(
        &mut self,
        sink: &mut S,
        out_buf: &mut RingBuffer,
        plays: &mut PlayQueue,
        upstream_done: bool,
        gain_shift: u32,
        events: &mut Vec<TrackEvent>,
    ) -> Result<()> {
        loop {
            let more = match self.phase {
                PlayerPhase::Idle => false,
                PlayerPhase::Starting => self.start_track(sink, out_buf, plays, upstream_done, events)?,
                PlayerPhase::Playing => {
                    self.play_chunk(sink, out_buf, plays, upstream_done, gain_shift, events)?
                }
                PlayerPhase::Ending => {
                    self.end_track(plays, events);
                    true
                }
            };
            if !more {
                return Ok(());
            }
        }
    }

    fn start_track<S: AudioSink>(
        &mut self,
        sink: &mut S,
        out_buf: &RingBuffer,
        plays: &PlayQueue,
        upstream_done: bool,
        events: &mut Vec<TrackEvent>,
    ) -> Result<bool> {
        let Some(track) = plays.front() else {
            if upstream_done && out_buf.is_empty() && sink.drained() {
                self.finish_playlist(sink, events);
            }
            return Ok(false);
        };
        if sink.format() != Some(track.format) {
            if sink.format().is_some() && !sink.drained() {
                tracing::trace!(format = %track.format, "waiting for output to drain");
                return Ok(false);
            }
            tracing::info!(format = %track.format, "reconfiguring output");
            sink.configure(track.format)
                .with_context(|| format!("configure output for {}", track.format))?;
        }
        self.played = 0;
        self.started += 1;
        events.push(TrackEvent::PlayStarted {
            tag: track.tag.clone(),
        });
        self.phase = PlayerPhase::Playing;
        Ok(true)
    }

    fn play_chunk<S: AudioSink>(
        &mut self,
        sink: &mut S,
        out_buf: &mut RingBuffer,
        plays: &PlayQueue,
        upstream_done: bool,
        gain_shift: u32,
        events: &mut Vec<TrackEvent>,
    ) -> Result<bool> {
        let Some(track) = plays.front() else {
            self.phase = PlayerPhase::Starting;
            return Ok(true);
        };
        let remaining = track.decoded_len.map(|len| len.saturating_sub(self.played));
        if remaining == Some(0) {
            self.phase = PlayerPhase::Ending;
            return Ok(true);
        }
        let ready = sink.ready();
        if !ready.is_set() {
            return Ok(false);
        }

        let frame = track.format.bytes_per_frame().max(1);
        let mut n = out_buf.read_available().min(self.chunk.len());
        if let Some(left) = remaining {
            n = n.min(usize::try_from(left).unwrap_or(usize::MAX));
        }
        n -= n % frame;
        if n == 0 {
            if upstream_done {
                tracing::warn!(played = self.played, "track ended short of its decoded length");
                self.phase = PlayerPhase::Ending;
                return Ok(true);
            }
            tracing::warn!(played = self.played, "play buffer starved");
            events.push(TrackEvent::Starved);
            self.starvations += 1;
            self.starved = true;
            self.phase = PlayerPhase::Idle;
            return Ok(false);
        }

        ready.take();
        let chunk = &mut self.chunk[..n];
        out_buf.read(chunk);
        apply_gain(chunk, track.format.bits_per_sample, gain_shift);
        sink.write(chunk).context("write to output")?;
        self.played += n as u64;
        if track.decoded_len == Some(self.played) {
            self.phase = PlayerPhase::Ending;
            return Ok(true);
        }
        Ok(false)
    }

    fn end_track(&mut self, plays: &mut PlayQueue, events: &mut Vec<TrackEvent>) {
        if let Some(track) = plays.pop_front() {
            tracing::debug!(tag = %track.tag, bytes = self.played, "track played");
            events.push(TrackEvent::PlayFinished { tag: track.tag });
        }
        self.played = 0;
        self.phase = PlayerPhase::Starting;
    }

    fn finish_playlist<S: AudioSink>(&mut self, sink: &mut S, events: &mut Vec<TrackEvent>) {
        sink.deinit();
        events.push(TrackEvent::PlaylistFinished);
        self.phase = PlayerPhase::Idle;
    }
}
