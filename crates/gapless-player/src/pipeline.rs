//! Playback orchestrator.
//!
//! [`AudioPlayer`] owns the two rings and the three stages and advances them from a single
//! [`audio_pump`](AudioPlayer::audio_pump) call per tick, always in the order reader,
//! decoder, player. Stage lifecycle events are forwarded to [`PlayerEvents`] as text.

use anyhow::{Context, Result, bail};
use gapless_types::{PipelineStatus, PlaybackState, TrackEvent};

use crate::codec::Codec;
use crate::config::PipelineConfig;
use crate::decoder::TrackDecoder;
use crate::demux::PACKET_SIZE;
use crate::net::Connector;
use crate::player::{PlayQueue, TrackPlayer};
use crate::reader::{ReaderNotice, TrackReader};
use crate::ring::{OverflowRing, RingBuffer};
use crate::sink::{AudioSink, MAX_VOLUME, MIN_VOLUME, volume_shift};
use crate::track::PlaylistEntry;

/// Callbacks for whoever presents playback to the user.
pub trait PlayerEvents {
    /// Titles of the track at the playlist head and the one after it ("" when absent).
    fn on_display_update(&mut self, current: &str, next: &str);

    /// One human-readable lifecycle message.
    fn on_message(&mut self, text: &str);
}

pub struct AudioPlayer<C: Connector, K: Codec, S: AudioSink> {
    config: PipelineConfig,
    in_buf: OverflowRing,
    out_buf: RingBuffer,
    reader: TrackReader<C>,
    decoder: TrackDecoder<K>,
    player: TrackPlayer,
    plays: PlayQueue,
    sink: S,
    events: Box<dyn PlayerEvents>,
    playlist: Vec<PlaylistEntry>,
    /// Playlist index of the track being played (or next to play).
    position: usize,
    state: PlaybackState,
    volume: u8,
    pending: Vec<TrackEvent>,
    decode_reported: bool,
}

impl<C: Connector, K: Codec, S: AudioSink> AudioPlayer<C, K, S> {
    pub fn new(
        config: PipelineConfig,
        connector: C,
        codec: K,
        sink: S,
        events: Box<dyn PlayerEvents>,
    ) -> Result<Self> {
        config.validate().context("invalid pipeline config")?;
        let overflow = config
            .contiguous_bytes
            .max(PACKET_SIZE)
            .min(config.in_buffer_bytes);
        Ok(Self {
            in_buf: OverflowRing::new(config.in_buffer_bytes, overflow),
            out_buf: RingBuffer::new(config.out_buffer_bytes),
            reader: TrackReader::new(connector, &config),
            decoder: TrackDecoder::new(codec, &config),
            player: TrackPlayer::new(config.play_chunk_bytes),
            plays: PlayQueue::default(),
            sink,
            events,
            playlist: Vec::new(),
            position: 0,
            state: PlaybackState::Stopped,
            volume: MAX_VOLUME,
            pending: Vec::new(),
            decode_reported: false,
            config,
        })
    }

    /// Replace the playlist. Stops playback; call [`play`](Self::play) to start.
    pub fn set_playlist<T, U>(&mut self, titles: &[T], urls: &[U]) -> Result<()>
    where
        T: AsRef<str>,
        U: AsRef<str>,
    {
        if titles.len() != urls.len() {
            bail!(
                "playlist has {} titles but {} urls",
                titles.len(),
                urls.len()
            );
        }
        self.stop();
        self.playlist = titles
            .iter()
            .zip(urls)
            .enumerate()
            .map(|(i, (title, url))| {
                PlaylistEntry::new(i, title.as_ref(), url.as_ref().trim().replace(' ', "%20"))
            })
            .collect();
        tracing::info!(tracks = self.playlist.len(), "playlist set");
        self.update_display();
        Ok(())
    }

    pub fn play(&mut self) {
        match self.state {
            PlaybackState::Playing => {}
            PlaybackState::Paused => {
                tracing::info!("resuming");
                self.state = PlaybackState::Playing;
            }
            PlaybackState::Stopped => {
                if self.position >= self.playlist.len() {
                    tracing::warn!("nothing to play");
                    return;
                }
                self.state = PlaybackState::Playing;
                self.start_reading();
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            tracing::info!("paused");
            self.state = PlaybackState::Paused;
        }
    }

    /// Stop everything and return to the first track. Safe to call in any state.
    pub fn stop(&mut self) {
        let was = self.state;
        self.reset_pipeline();
        self.state = PlaybackState::Stopped;
        self.position = 0;
        if was != PlaybackState::Stopped {
            tracing::info!("stopped");
            self.update_display();
        }
    }

    /// Go back one track and restart from there. Before the first track this stops playback.
    pub fn rewind(&mut self) {
        match self.position.checked_sub(1) {
            Some(target) => self.jump_to(target),
            None => self.leave_playlist(),
        }
    }

    /// Skip to the next track. Past the last track this stops playback.
    pub fn ffwd(&mut self) {
        let target = self.position + 1;
        if target >= self.playlist.len() {
            self.leave_playlist();
            return;
        }
        self.jump_to(target);
    }

    pub fn get_volume(&self) -> u8 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<()> {
        if !(MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
            bail!("volume {volume} out of range {MIN_VOLUME}..={MAX_VOLUME}");
        }
        self.volume = volume;
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state == PlaybackState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state == PlaybackState::Stopped
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Advance all stages by one tick.
    ///
    /// Errors come from codec or output initialisation; playback is stopped before they
    /// are returned.
    pub fn audio_pump(&mut self) -> Result<()> {
        if self.state == PlaybackState::Stopped {
            return Ok(());
        }

        match self.reader.pump(&mut self.in_buf, &mut self.pending) {
            Some(ReaderNotice::Scheduled(desc)) => self.decoder.add_to_decode_list(desc),
            Some(ReaderNotice::Truncated { seq, length }) => self.decoder.truncate(seq, length),
            None => {}
        }

        if let Some(next_len) = self.decoder.next_input_len()
            && self.decoder.is_idle()
        {
            let wanted = next_len.min(self.config.min_decode_start_bytes as u64);
            if self.in_buf.read_available() as u64 >= wanted {
                self.decoder.start();
            }
        }
        if let Err(e) = self
            .decoder
            .pump(&mut self.in_buf, &mut self.out_buf, &mut self.plays, &mut self.pending)
        {
            self.stop();
            return Err(e.context("decoder failed"));
        }

        let upstream_done = self.reader.is_done() && self.decoder.is_done();
        if upstream_done && !self.decode_reported {
            self.decode_reported = true;
            self.pending.push(TrackEvent::PlaylistDecoded);
        }

        if self.state == PlaybackState::Playing {
            if self.player.is_idle() && self.backlog_ready(upstream_done) {
                self.player.start();
            }
            let shift = volume_shift(self.volume);
            let played = self
                .player
                .pump(
                    &mut self.sink,
                    &mut self.out_buf,
                    &mut self.plays,
                    upstream_done,
                    shift,
                    &mut self.pending,
                )
                .context("output failed");
            if let Err(e) = played {
                self.stop();
                return Err(e);
            }
        }

        debug_assert!(
            self.player.started() <= self.decoder.started()
                && self.decoder.started() <= self.reader.scheduled(),
            "stage cursors out of order: played {} decoded {} read {}",
            self.player.started(),
            self.decoder.started(),
            self.reader.scheduled()
        );

        self.dispatch_events();
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state,
            volume: self.volume,
            current_title: self.playlist.get(self.position).map(|e| e.title.clone()),
            next_title: self.playlist.get(self.position + 1).map(|e| e.title.clone()),
            reader: self.reader.phase(),
            decoder: self.decoder.phase(),
            player: self.player.phase(),
            in_buffered: self.in_buf.read_available(),
            in_capacity: self.in_buf.capacity(),
            out_buffered: self.out_buf.read_available(),
            out_capacity: self.out_buf.capacity(),
            tracks_read: self.reader.scheduled(),
            tracks_decoded: self.decoder.started(),
            tracks_played: self.player.started(),
            sink_format: self.sink.format(),
            last_decode_break: self.decoder.last_break(),
            starvations: self.player.starvations(),
        }
    }

    /// Whether the idle player may (re)start.
    fn backlog_ready(&self, upstream_done: bool) -> bool {
        if upstream_done {
            return true;
        }
        let Some(track) = self.plays.front() else {
            return false;
        };
        let buffered = self.out_buf.read_available();
        if let Some(len) = track.decoded_len
            && buffered as u64 >= len.saturating_sub(self.player.played())
        {
            return true;
        }
        buffered >= self.config.backlog_bytes(track.format.bytes_per_second())
    }

    fn start_reading(&mut self) {
        self.decode_reported = false;
        self.reader
            .set_playlist(self.playlist[self.position..].iter().cloned());
        self.reader.start();
        self.update_display();
    }

    /// Skipping out of the playlist stops a playing pipeline and is ignored otherwise.
    fn leave_playlist(&mut self) {
        if self.state == PlaybackState::Playing {
            self.stop();
        }
    }

    fn jump_to(&mut self, position: usize) {
        if self.playlist.is_empty() {
            return;
        }
        self.reset_pipeline();
        self.position = position;
        tracing::info!(position, "jumping to track");
        if self.state == PlaybackState::Stopped {
            self.update_display();
        } else {
            self.start_reading();
        }
    }

    fn reset_pipeline(&mut self) {
        self.reader.reset();
        self.decoder.reset();
        self.player.reset();
        self.plays.clear();
        self.in_buf.reset();
        self.out_buf.reset();
        self.sink.deinit();
        self.pending.clear();
        self.decode_reported = false;
    }

    fn dispatch_events(&mut self) {
        let mut finished = false;
        for event in std::mem::take(&mut self.pending) {
            tracing::debug!(%event, "pipeline event");
            self.events.on_message(&event.to_string());
            match event {
                TrackEvent::PlayStarted { tag } => {
                    self.position = tag.position;
                    self.update_display();
                }
                TrackEvent::PlaylistFinished => finished = true,
                _ => {}
            }
        }
        if finished {
            self.stop();
        }
    }

    fn update_display(&mut self) {
        let current = self
            .playlist
            .get(self.position)
            .map(|e| e.title.as_str())
            .unwrap_or("");
        let next = self
            .playlist
            .get(self.position + 1)
            .map(|e| e.title.as_str())
            .unwrap_or("");
        self.events.on_display_update(current, next);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gapless_types::PlayerPhase;

    use super::*;
    use crate::test_support::{
        EchoCodec, MockNet, MockSink, ReadStep, RecordingEvents, ok_response, pattern,
    };

    type TestPlayer = AudioPlayer<MockNet, EchoCodec, MockSink>;

    fn config() -> PipelineConfig {
        PipelineConfig {
            out_buffer_bytes: 32 * 1024,
            max_decode_unit_bytes: 4096,
            play_chunk_bytes: 2048,
            min_backlog: Duration::from_millis(50),
            decode_budget: Duration::from_secs(1),
            connect_settle_ticks: 0,
            ..PipelineConfig::default()
        }
    }

    fn player_with(net: &MockNet, cfg: PipelineConfig) -> (TestPlayer, RecordingEvents) {
        let events = RecordingEvents::default();
        let player = AudioPlayer::new(
            cfg,
            net.clone(),
            EchoCodec::new(),
            MockSink::new(),
            Box::new(events.clone()),
        )
        .unwrap();
        (player, events)
    }

    fn run_until_stopped(player: &mut TestPlayer, ticks: usize) {
        for _ in 0..ticks {
            player.audio_pump().unwrap();
            if player.is_stopped() {
                return;
            }
        }
        panic!("playlist did not finish in {ticks} ticks");
    }

    #[test]
    fn set_playlist_validates_and_encodes() {
        let net = MockNet::new();
        let (mut player, events) = player_with(&net, config());
        assert!(player.set_playlist(&["a", "b"], &["http://h/a.aac"]).is_err());

        player
            .set_playlist(&["First", "Second"], &["http://h/my track.aac", "http://h/b.aac"])
            .unwrap();
        assert_eq!(player.playlist[0].url, "http://h/my%20track.aac");
        assert_eq!(
            events.displays.borrow().last(),
            Some(&("First".to_string(), "Second".to_string()))
        );
        assert!(player.is_stopped());
        assert_eq!(net.targets().len(), 0);
    }

    #[test]
    fn rejects_an_output_ring_too_small_to_decode_into() {
        let cfg = PipelineConfig {
            out_buffer_bytes: 2048,
            max_decode_unit_bytes: 4096,
            ..config()
        };
        let built = AudioPlayer::new(
            cfg,
            MockNet::new(),
            EchoCodec::new(),
            MockSink::new(),
            Box::new(RecordingEvents::default()),
        );
        assert!(built.is_err());
    }

    #[test]
    fn volume_is_bounded() {
        let net = MockNet::new();
        let (mut player, _) = player_with(&net, config());
        assert_eq!(player.get_volume(), 11);
        player.set_volume(3).unwrap();
        assert_eq!(player.get_volume(), 3);
        assert!(player.set_volume(0).is_err());
        assert!(player.set_volume(12).is_err());
        assert_eq!(player.get_volume(), 3);
    }

    #[test]
    fn plays_tracks_gaplessly() {
        let net = MockNet::new();
        let a = pattern(1, 20_000);
        let b = pattern(2, 12_000);
        net.push(vec![ReadStep::Data(ok_response(&a))]);
        net.push(vec![ReadStep::Data(ok_response(&b))]);
        let (mut player, events) = player_with(&net, config());
        player
            .set_playlist(&["A", "B"], &["http://h/a.aac", "http://h/b.aac"])
            .unwrap();
        player.play();

        let mut playing = false;
        for _ in 0..2000 {
            player.audio_pump().unwrap();
            if player.is_stopped() {
                break;
            }
            let phase = player.status().player;
            if playing {
                assert_ne!(phase, PlayerPhase::Idle, "player went idle between tracks");
            } else {
                playing = phase != PlayerPhase::Idle;
            }
        }
        assert!(player.is_stopped());

        let mut expected = a;
        expected.extend(b);
        assert_eq!(player.sink().written, expected);
        assert_eq!(player.sink().configured.len(), 1);
        let messages = events.messages.borrow();
        assert!(messages.iter().any(|m| m.starts_with("Finished playing track 1")));
        assert!(messages.iter().any(|m| m == "Finished reading playlist"));
        assert!(messages.iter().any(|m| m == "Finished decoding playlist"));
        assert_eq!(messages.last().map(String::as_str), Some("Finished playing playlist"));
        assert!(!messages.iter().any(|m| m == "Play buffer starved"));
    }

    #[test]
    fn recovers_from_starvation_without_play() {
        let net = MockNet::new();
        let a = pattern(3, 20_000);
        let response = ok_response(&a);
        let head_len = response.len() - a.len();
        let split = head_len + 8000;
        let mut steps = vec![ReadStep::Data(response[..split].to_vec())];
        steps.extend(std::iter::repeat_n(ReadStep::WouldBlock, 30));
        steps.push(ReadStep::Data(response[split..].to_vec()));
        net.push(steps);

        let cfg = PipelineConfig {
            play_chunk_bytes: 64 * 1024,
            min_backlog: Duration::from_millis(25),
            ..config()
        };
        let (mut player, events) = player_with(&net, cfg);
        player.set_playlist(&["A"], &["http://h/a.aac"]).unwrap();
        player.play();
        run_until_stopped(&mut player, 500);

        assert_eq!(player.sink().written, a);
        let messages = events.messages.borrow();
        let starved = messages.iter().position(|m| m == "Play buffer starved");
        let finished = messages.iter().position(|m| m == "Finished playing playlist");
        assert!(starved.is_some());
        assert!(starved < finished);
    }

    #[test]
    fn pause_holds_output_while_pipeline_keeps_filling() {
        let net = MockNet::new();
        let a = pattern(4, 30_000);
        net.push(vec![ReadStep::Data(ok_response(&a))]);
        let (mut player, _) = player_with(&net, config());
        player.set_playlist(&["A"], &["http://h/a.aac"]).unwrap();
        player.play();
        while player.sink().written.is_empty() {
            player.audio_pump().unwrap();
        }
        player.pause();
        assert!(player.is_paused());
        let written = player.sink().written.len();
        for _ in 0..10 {
            player.audio_pump().unwrap();
        }
        assert_eq!(player.sink().written.len(), written);
        assert!(player.status().out_buffered > 0);

        player.play();
        run_until_stopped(&mut player, 500);
        assert_eq!(player.sink().written, a);
    }

    #[test]
    fn stop_is_idempotent_and_releases_everything() {
        let net = MockNet::new();
        net.push(vec![ReadStep::WouldBlock]);
        let (mut player, _) = player_with(&net, config());
        player
            .set_playlist(&["A", "B"], &["http://h/a.aac", "http://h/b.aac"])
            .unwrap();
        player.play();
        player.audio_pump().unwrap();
        assert_eq!(net.live(), 1);

        player.stop();
        player.stop();
        assert!(player.is_stopped());
        assert_eq!(net.live(), 0);
        let status = player.status();
        assert_eq!(status.in_buffered, 0);
        assert_eq!(status.out_buffered, 0);
        assert_eq!(status.current_title.as_deref(), Some("A"));
        assert_eq!(status.tracks_read, 0);
        // A stopped pipeline does nothing.
        player.audio_pump().unwrap();
        assert_eq!(net.targets().len(), 1);
    }

    #[test]
    fn ffwd_and_rewind_restart_reading() {
        let net = MockNet::new();
        for _ in 0..4 {
            net.push(vec![ReadStep::WouldBlock]);
        }
        let (mut player, events) = player_with(&net, config());
        player
            .set_playlist(
                &["A", "B", "C"],
                &["http://h/a.aac", "http://h/b.aac", "http://h/c.aac"],
            )
            .unwrap();
        player.play();
        player.audio_pump().unwrap();

        player.ffwd();
        player.audio_pump().unwrap();
        assert_eq!(net.targets().last().map(String::as_str), Some("http://h/b.aac"));
        assert_eq!(
            events.displays.borrow().last(),
            Some(&("B".to_string(), "C".to_string()))
        );

        player.rewind();
        player.audio_pump().unwrap();
        assert_eq!(net.targets().last().map(String::as_str), Some("http://h/a.aac"));
        assert!(player.is_playing());

        player.ffwd();
        player.ffwd();
        assert_eq!(player.status().current_title.as_deref(), Some("C"));
        player.ffwd();
        assert!(player.is_stopped());
        assert_eq!(player.status().current_title.as_deref(), Some("A"));
    }

    #[test]
    fn skipping_out_of_the_playlist_stops_only_while_playing() {
        let net = MockNet::new();
        net.push(vec![ReadStep::WouldBlock]);
        net.push(vec![ReadStep::WouldBlock]);
        let (mut player, _) = player_with(&net, config());
        player
            .set_playlist(&["A", "B"], &["http://h/a.aac", "http://h/b.aac"])
            .unwrap();

        player.rewind();
        assert!(player.is_stopped());
        assert_eq!(net.targets().len(), 0);

        player.ffwd();
        assert_eq!(player.status().current_title.as_deref(), Some("B"));
        player.ffwd();
        assert!(player.is_stopped());
        assert_eq!(player.status().current_title.as_deref(), Some("B"));

        player.rewind();
        player.play();
        player.audio_pump().unwrap();
        assert_eq!(net.targets(), vec!["http://h/a.aac".to_string()]);
        player.rewind();
        assert!(player.is_stopped());
        assert_eq!(net.live(), 0);
        assert_eq!(player.status().current_title.as_deref(), Some("A"));
    }

    #[test]
    fn skipped_tracks_still_finish_the_playlist() {
        let net = MockNet::new();
        let b = pattern(5, 4000);
        net.push(vec![ReadStep::Data(crate::test_support::http_response(500, &[], b""))]);
        net.push(vec![ReadStep::Data(ok_response(&b))]);
        let (mut player, events) = player_with(&net, config());
        player
            .set_playlist(&["A", "B"], &["http://h/a.aac", "http://h/b.aac"])
            .unwrap();
        player.play();
        run_until_stopped(&mut player, 500);

        assert_eq!(player.sink().written, b);
        let messages = events.messages.borrow();
        assert!(messages.iter().any(|m| m.starts_with("Skipping track 1") && m.ends_with("HTTP status 500")));
        assert!(messages.iter().any(|m| m.starts_with("Start playing track 2")));
    }
}
