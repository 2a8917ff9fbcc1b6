//! Network reader: streams each playlist entry into the input ring.
//!
//! One track is in flight at a time. Starting a track walks a few non-blocking steps
//! (settle, connect, send the ranged GET, collect the response head); after that every pump
//! performs at most one socket read sized to the free space in the ring. A connection that
//! closes or errors before the declared length is reopened with `Range: bytes=K-`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use gapless_types::{ContainerFormat, ReaderPhase, TrackEvent};

use crate::config::PipelineConfig;
use crate::http::{HttpTarget, find_head_end, parse_response_head};
use crate::net::{Connection, Connector};
use crate::ring::OverflowRing;
use crate::track::{PlaylistEntry, TrackDescriptor, container_for_url};

/// Response heads larger than this are treated as a protocol error.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Something the decoder side needs to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderNotice {
    /// A track's length is known and its bytes will follow in the input ring.
    Scheduled(TrackDescriptor),
    /// A scheduled track was given up; only `length` input bytes will ever arrive.
    Truncated { seq: u64, length: u64 },
}

enum StartStep {
    Settle(u32),
    Connect,
    SendRequest { request: Vec<u8>, sent: usize },
    ReadHead { head: Vec<u8> },
}

enum Flow {
    Next(StartStep),
    Wait(StartStep),
    Done(Option<ReaderNotice>),
}

struct ReadTrack {
    entry: PlaylistEntry,
    target: HttpTarget,
    container: ContainerFormat,
    /// Assigned once the first response head gave us a length.
    seq: Option<u64>,
    length: Option<u64>,
    bytes_read: u64,
    redirected: bool,
    /// Consecutive connection failures without progress.
    attempts: u32,
    /// Body bytes to drop: a server answered a resume with the whole resource.
    discard: u64,
}

pub struct TrackReader<C: Connector> {
    connector: C,
    phase: ReaderPhase,
    step: StartStep,
    playlist: VecDeque<PlaylistEntry>,
    current: Option<ReadTrack>,
    conn: Option<Box<dyn Connection>>,
    scratch: Box<[u8]>,
    /// Body bytes that arrived together with the response head.
    pending_body: Vec<u8>,
    scheduled: u64,
    settle_ticks: u32,
    max_resume_attempts: u32,
}

impl<C: Connector> TrackReader<C> {
    pub fn new(connector: C, config: &PipelineConfig) -> Self {
        Self {
            connector,
            phase: ReaderPhase::Idle,
            step: StartStep::Connect,
            playlist: VecDeque::new(),
            current: None,
            conn: None,
            scratch: vec![0u8; config.read_chunk_bytes.max(1)].into_boxed_slice(),
            pending_body: Vec::new(),
            scheduled: 0,
            settle_ticks: config.connect_settle_ticks,
            max_resume_attempts: config.max_resume_attempts,
        }
    }

    /// Replace the entries still to be read.
    pub fn set_playlist(&mut self, entries: impl IntoIterator<Item = PlaylistEntry>) {
        self.playlist = entries.into_iter().collect();
    }

    /// Begin reading if idle and there is anything left to read.
    pub fn start(&mut self) {
        if self.phase == ReaderPhase::Idle && !self.playlist.is_empty() {
            self.phase = ReaderPhase::Starting;
        }
    }

    /// Drop the connection and forget all tracks. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.conn = None;
        self.current = None;
        self.playlist.clear();
        self.pending_body.clear();
        self.phase = ReaderPhase::Idle;
        self.step = StartStep::Connect;
        self.scheduled = 0;
    }

    pub fn phase(&self) -> ReaderPhase {
        self.phase
    }

    /// Tracks handed to the decoder since the last reset.
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    /// Nothing in flight and nothing left to read.
    pub fn is_done(&self) -> bool {
        self.phase == ReaderPhase::Idle && self.current.is_none() && self.playlist.is_empty()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Advance the reader by one step.
    pub fn pump(
        &mut self,
        in_buf: &mut OverflowRing,
        events: &mut Vec<TrackEvent>,
    ) -> Option<ReaderNotice> {
        match self.phase {
            ReaderPhase::Idle => None,
            ReaderPhase::Starting => self.pump_starting(events),
            ReaderPhase::Reading => self.pump_reading(in_buf, events),
            ReaderPhase::EndingTrack => {
                self.conn = None;
                if self.playlist.is_empty() {
                    events.push(TrackEvent::PlaylistRead);
                    self.phase = ReaderPhase::Idle;
                } else {
                    self.phase = ReaderPhase::Starting;
                }
                None
            }
        }
    }

    fn pump_starting(&mut self, events: &mut Vec<TrackEvent>) -> Option<ReaderNotice> {
        if self.current.is_none() && !self.begin_next_track(events) {
            return None;
        }
        loop {
            let step = std::mem::replace(&mut self.step, StartStep::Connect);
            match self.advance(step, events) {
                Flow::Next(next) => self.step = next,
                Flow::Wait(next) => {
                    self.step = next;
                    return None;
                }
                Flow::Done(notice) => return notice,
            }
        }
    }

    /// Pop the next entry into `current`. Returns `false` if nothing could be started.
    fn begin_next_track(&mut self, events: &mut Vec<TrackEvent>) -> bool {
        let Some(entry) = self.playlist.pop_front() else {
            self.phase = ReaderPhase::Idle;
            return false;
        };
        events.push(TrackEvent::ReadStarted { tag: entry.tag() });

        let Some(container) = container_for_url(&entry.url) else {
            self.skip_entry(&entry, "unsupported file type".to_string(), events);
            return false;
        };
        let target = match HttpTarget::parse(&entry.url) {
            Ok(target) => target,
            Err(e) => {
                self.skip_entry(&entry, format!("{e:#}"), events);
                return false;
            }
        };
        tracing::debug!(url = %entry.url, container = container.label(), "reader starting track");
        self.current = Some(ReadTrack {
            entry,
            target,
            container,
            seq: None,
            length: None,
            bytes_read: 0,
            redirected: false,
            attempts: 0,
            discard: 0,
        });
        self.step = StartStep::Settle(self.settle_ticks);
        true
    }

    fn skip_entry(&mut self, entry: &PlaylistEntry, reason: String, events: &mut Vec<TrackEvent>) {
        tracing::warn!(url = %entry.url, %reason, "skipping track");
        events.push(TrackEvent::ReadFailed {
            tag: entry.tag(),
            reason,
        });
        self.phase = ReaderPhase::EndingTrack;
    }

    fn advance(&mut self, step: StartStep, events: &mut Vec<TrackEvent>) -> Flow {
        match step {
            StartStep::Settle(0) => Flow::Next(StartStep::Connect),
            StartStep::Settle(n) => Flow::Wait(StartStep::Settle(n - 1)),
            StartStep::Connect => self.connect(events),
            StartStep::SendRequest { request, sent } => self.send_request(request, sent, events),
            StartStep::ReadHead { head } => self.read_head(head, events),
        }
    }

    fn connect(&mut self, events: &mut Vec<TrackEvent>) -> Flow {
        let Some(track) = self.current.as_ref() else {
            return Flow::Done(None);
        };
        match self.connector.connect(&track.target) {
            Ok(conn) => {
                tracing::debug!(url = track.target.as_str(), offset = track.bytes_read, "connected");
                let request = track.target.request(track.bytes_read).into_bytes();
                self.conn = Some(conn);
                Flow::Next(StartStep::SendRequest { request, sent: 0 })
            }
            Err(e) => self.connection_failed(format!("{e:#}"), events),
        }
    }

    fn send_request(&mut self, request: Vec<u8>, mut sent: usize, events: &mut Vec<TrackEvent>) -> Flow {
        let Some(conn) = self.conn.as_mut() else {
            return Flow::Next(StartStep::Connect);
        };
        while sent < request.len() {
            match conn.write(&request[sent..]) {
                Ok(0) => return self.connection_failed("connection closed while sending request".into(), events),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Flow::Wait(StartStep::SendRequest { request, sent });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return self.connection_failed(format!("send request: {e}"), events),
            }
        }
        match conn.flush() {
            Ok(()) => Flow::Next(StartStep::ReadHead { head: Vec::new() }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Flow::Wait(StartStep::SendRequest { request, sent })
            }
            Err(e) => self.connection_failed(format!("send request: {e}"), events),
        }
    }

    fn read_head(&mut self, mut head: Vec<u8>, events: &mut Vec<TrackEvent>) -> Flow {
        let Some(conn) = self.conn.as_mut() else {
            return Flow::Next(StartStep::Connect);
        };
        match conn.read(&mut self.scratch) {
            Ok(0) => self.connection_failed("connection closed before response".into(), events),
            Ok(n) => {
                head.extend_from_slice(&self.scratch[..n]);
                if let Some(end) = find_head_end(&head) {
                    let body = head.split_off(end);
                    return self.handle_head(&head, body, events);
                }
                if head.len() > MAX_HEAD_BYTES {
                    return Flow::Done(self.fail_track("response head too large".into(), events));
                }
                Flow::Wait(StartStep::ReadHead { head })
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Flow::Wait(StartStep::ReadHead { head })
            }
            Err(e) => self.connection_failed(format!("read response: {e}"), events),
        }
    }

    fn handle_head(&mut self, head: &[u8], body: Vec<u8>, events: &mut Vec<TrackEvent>) -> Flow {
        let parsed = match parse_response_head(head) {
            Ok(parsed) => parsed,
            Err(e) => return Flow::Done(self.fail_track(format!("{e:#}"), events)),
        };
        let Some(track) = self.current.as_mut() else {
            return Flow::Done(None);
        };

        if parsed.is_redirect() {
            self.conn = None;
            if track.redirected {
                return Flow::Done(self.fail_track("redirected more than once".into(), events));
            }
            let Some(location) = parsed.location.as_deref() else {
                return Flow::Done(self.fail_track("redirect without Location".into(), events));
            };
            return match track.target.redirect(location) {
                Ok(target) => {
                    tracing::info!(from = track.target.as_str(), to = target.as_str(), "following redirect");
                    track.target = target;
                    track.redirected = true;
                    Flow::Wait(StartStep::Connect)
                }
                Err(e) => Flow::Done(self.fail_track(format!("{e:#}"), events)),
            };
        }
        if !parsed.is_success() {
            let reason = format!("HTTP status {}", parsed.status);
            return Flow::Done(self.fail_track(reason, events));
        }

        let offset = track.bytes_read;
        let Some(total) = parsed.total_length() else {
            return Flow::Done(self.fail_track("response has no known length".into(), events));
        };
        if let Some(known) = track.length
            && known != total
        {
            let reason = format!("length changed from {known} to {total} bytes");
            return Flow::Done(self.fail_track(reason, events));
        }
        if total == 0 {
            return Flow::Done(self.fail_track("empty track".into(), events));
        }

        track.length = Some(total);
        track.discard = if parsed.status == 200 { offset } else { 0 };
        self.pending_body = body;
        self.phase = ReaderPhase::Reading;
        tracing::debug!(status = parsed.status, total, offset, "response accepted");

        if track.seq.is_some() {
            return Flow::Done(None);
        }
        let seq = self.scheduled;
        self.scheduled += 1;
        track.seq = Some(seq);
        Flow::Done(Some(ReaderNotice::Scheduled(TrackDescriptor {
            seq,
            tag: track.entry.tag(),
            title: track.entry.title.clone(),
            length: total,
            container: track.container,
        })))
    }

    /// Retry the connection from the current offset, or give up after too many failures.
    fn connection_failed(&mut self, reason: String, events: &mut Vec<TrackEvent>) -> Flow {
        self.conn = None;
        let Some(track) = self.current.as_mut() else {
            return Flow::Done(None);
        };
        track.attempts += 1;
        if track.attempts > self.max_resume_attempts {
            return Flow::Done(self.fail_track(reason, events));
        }
        tracing::warn!(url = %track.entry.url, attempt = track.attempts, %reason, "connection failed, retrying");
        Flow::Wait(StartStep::Settle(self.settle_ticks))
    }

    /// Give up on the current track and move on to the next entry.
    fn fail_track(&mut self, reason: String, events: &mut Vec<TrackEvent>) -> Option<ReaderNotice> {
        self.conn = None;
        self.pending_body.clear();
        self.phase = ReaderPhase::EndingTrack;
        let track = self.current.take()?;
        tracing::warn!(url = %track.entry.url, %reason, bytes_read = track.bytes_read, "giving up on track");
        events.push(TrackEvent::ReadFailed {
            tag: track.entry.tag(),
            reason,
        });
        track.seq.map(|seq| ReaderNotice::Truncated {
            seq,
            length: track.bytes_read,
        })
    }

    fn pump_reading(
        &mut self,
        in_buf: &mut OverflowRing,
        events: &mut Vec<TrackEvent>,
    ) -> Option<ReaderNotice> {
        let Some(track) = self.current.as_mut() else {
            self.phase = ReaderPhase::EndingTrack;
            return None;
        };
        let remaining = track.length.unwrap_or(0).saturating_sub(track.bytes_read);

        if !self.pending_body.is_empty() {
            let n = deliver(track, &self.pending_body, remaining, in_buf);
            self.pending_body.drain(..n.min(self.pending_body.len()));
            if track.bytes_read == track.length.unwrap_or(0) {
                self.pending_body.clear();
            }
            return self.check_complete(events);
        }

        let room = in_buf.write_available();
        if room == 0 {
            return None;
        }
        let want = if track.discard > 0 {
            self.scratch.len()
        } else {
            self.scratch.len().min(room).min(clamp_usize(remaining))
        };
        let Some(conn) = self.conn.as_mut() else {
            return self.resume(events);
        };
        match conn.read(&mut self.scratch[..want]) {
            Ok(0) => self.resume(events),
            Ok(n) => {
                track.attempts = 0;
                let used = deliver(track, &self.scratch[..n], remaining, in_buf);
                if used < n && track.bytes_read < track.length.unwrap_or(0) {
                    self.pending_body.extend_from_slice(&self.scratch[used..n]);
                }
                self.check_complete(events)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) => {
                tracing::warn!(error = %e, "read failed");
                self.resume(events)
            }
        }
    }

    fn check_complete(&mut self, events: &mut Vec<TrackEvent>) -> Option<ReaderNotice> {
        let track = self.current.as_ref()?;
        if Some(track.bytes_read) != track.length {
            return None;
        }
        tracing::debug!(url = %track.entry.url, bytes = track.bytes_read, "track read");
        events.push(TrackEvent::ReadFinished {
            tag: track.entry.tag(),
        });
        self.current = None;
        self.conn = None;
        self.pending_body.clear();
        self.phase = ReaderPhase::EndingTrack;
        None
    }

    /// The connection ended early: reopen it at the current offset.
    fn resume(&mut self, events: &mut Vec<TrackEvent>) -> Option<ReaderNotice> {
        self.conn = None;
        self.pending_body.clear();
        let track = self.current.as_mut()?;
        track.attempts += 1;
        if track.attempts > self.max_resume_attempts {
            return self.fail_track("connection lost".into(), events);
        }
        tracing::info!(url = %track.entry.url, offset = track.bytes_read, "connection lost, resuming");
        events.push(TrackEvent::ReadResumed {
            tag: track.entry.tag(),
            offset: track.bytes_read,
        });
        self.phase = ReaderPhase::Starting;
        self.step = StartStep::Connect;
        None
    }
}

/// Push body bytes into the ring, dropping any leading bytes still owed to `discard`.
///
/// Returns how many bytes of `data` were used (written or discarded).
fn deliver(track: &mut ReadTrack, data: &[u8], remaining: u64, in_buf: &mut OverflowRing) -> usize {
    let skip = clamp_usize(track.discard).min(data.len());
    track.discard -= skip as u64;
    let take = (data.len() - skip)
        .min(clamp_usize(remaining))
        .min(in_buf.write_available());
    in_buf.write(&data[skip..skip + take]);
    track.bytes_read += take as u64;
    if take as u64 == remaining {
        // Anything past the declared length is ignored.
        return data.len();
    }
    skip + take
}

fn clamp_usize(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}
