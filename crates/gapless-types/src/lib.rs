//! Shared types for the gapless streaming pipeline.
//!
//! Everything here is plain data: phase enums for each pipeline stage, the PCM format
//! negotiated between decoder and sink, lifecycle events, and the status snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// User-facing transport state of the orchestrator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Input framing of a track, chosen from the URL extension.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// AAC carried in 188-byte MPEG transport stream packets (`.ts`).
    Transport,
    /// Raw ADTS-framed AAC elementary stream (`.aac`).
    Adts,
}

impl ContainerFormat {
    /// Map a lowercase file extension to a container format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "ts" => Some(Self::Transport),
            "aac" => Some(Self::Adts),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Transport => "mpeg-ts",
            Self::Adts => "adts",
        }
    }
}

/// Interleaved little-endian PCM layout produced by the decoder.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate (Hz).
    pub sample_rate: u32,
    /// Bits per sample (16 or 32).
    pub bits_per_sample: u16,
    /// Channel count.
    pub channels: u16,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    /// Bytes of PCM per second of audio.
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz / {} bit / {} ch",
            self.sample_rate, self.bits_per_sample, self.channels
        )
    }
}

/// Track reader state machine phase.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReaderPhase {
    #[default]
    Idle,
    Starting,
    Reading,
    EndingTrack,
}

/// Track decoder state machine phase.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecoderPhase {
    #[default]
    Idle,
    TrackStart,
    ReadInfo,
    Decoding,
    /// Discarding the unread input of an abandoned track.
    Skipping,
}

/// Track player state machine phase.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlayerPhase {
    #[default]
    Idle,
    Starting,
    Playing,
    Ending,
}

/// Why the decoder's time-boxed loop returned on its last pump.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeBreak {
    /// Not enough room in the PCM buffer for one more decode unit.
    OutBufferFull,
    /// The per-tick time budget ran out.
    Timeout,
    /// Waiting for the network to deliver more input.
    InputStarved,
    /// The current track finished decoding.
    TrackFinished,
    /// The current track was abandoned.
    TrackAbandoned,
    /// No track is queued for decoding.
    NoTrack,
}

/// Identifies a playlist track in lifecycle messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackTag {
    /// Zero-based playlist position.
    pub position: usize,
    /// Opaque identifier derived from the track URL.
    pub id: String,
}

impl fmt::Display for TrackTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.id.get(..8).unwrap_or(&self.id);
        write!(f, "{} [{}]", self.position + 1, short)
    }
}

/// Lifecycle events emitted by the pipeline stages.
///
/// The `Display` impl renders the text delivered to `on_message`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackEvent {
    ReadStarted { tag: TrackTag },
    ReadResumed { tag: TrackTag, offset: u64 },
    ReadFinished { tag: TrackTag },
    ReadFailed { tag: TrackTag, reason: String },
    PlaylistRead,
    DecodeStarted { tag: TrackTag },
    DecodeFinished { tag: TrackTag, decoded_bytes: u64 },
    DecodeAbandoned { tag: TrackTag, reason: String },
    PlaylistDecoded,
    PlayStarted { tag: TrackTag },
    PlayFinished { tag: TrackTag },
    Starved,
    PlaylistFinished,
}

impl fmt::Display for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadStarted { tag } => write!(f, "Start reading track {tag}"),
            Self::ReadResumed { tag, offset } => {
                write!(f, "Resume reading track {tag} at byte {offset}")
            }
            Self::ReadFinished { tag } => write!(f, "Finished reading track {tag}"),
            Self::ReadFailed { tag, reason } => write!(f, "Skipping track {tag}: {reason}"),
            Self::PlaylistRead => write!(f, "Finished reading playlist"),
            Self::DecodeStarted { tag } => write!(f, "Start decoding track {tag}"),
            Self::DecodeFinished { tag, decoded_bytes } => {
                write!(f, "Finished decoding track {tag} ({decoded_bytes} bytes)")
            }
            Self::DecodeAbandoned { tag, reason } => {
                write!(f, "Abandoned decoding track {tag}: {reason}")
            }
            Self::PlaylistDecoded => write!(f, "Finished decoding playlist"),
            Self::PlayStarted { tag } => write!(f, "Start playing track {tag}"),
            Self::PlayFinished { tag } => write!(f, "Finished playing track {tag}"),
            Self::Starved => write!(f, "Play buffer starved"),
            Self::PlaylistFinished => write!(f, "Finished playing playlist"),
        }
    }
}

/// Point-in-time view of the whole pipeline, for diagnostics and UIs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStatus {
    /// Transport state.
    pub state: PlaybackState,
    /// Volume step (1..=11).
    pub volume: u8,
    /// Title of the track at the playlist head.
    pub current_title: Option<String>,
    /// Title of the track after the head.
    pub next_title: Option<String>,
    pub reader: ReaderPhase,
    pub decoder: DecoderPhase,
    pub player: PlayerPhase,
    /// Bytes of compressed input waiting to be decoded.
    pub in_buffered: usize,
    pub in_capacity: usize,
    /// Bytes of decoded PCM waiting to be played.
    pub out_buffered: usize,
    pub out_capacity: usize,
    /// Tracks started by each stage since the last stop.
    pub tracks_read: u64,
    pub tracks_decoded: u64,
    pub tracks_played: u64,
    /// Format currently configured on the sink.
    pub sink_format: Option<PcmFormat>,
    /// Reason the decoder last yielded.
    pub last_decode_break: Option<DecodeBreak>,
    /// Number of starvation events since the last stop.
    pub starvations: u64,
}
