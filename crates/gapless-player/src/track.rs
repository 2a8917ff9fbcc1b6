//! Per-track bookkeeping shared by the reader, decoder, and player queues.

use gapless_types::{ContainerFormat, PcmFormat, TrackTag};
use sha2::{Digest, Sha256};

/// One playlist slot as handed to the reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub position: usize,
    pub title: String,
    pub url: String,
    /// Hex digest of the URL, used to correlate lifecycle messages.
    pub id: String,
}

impl PlaylistEntry {
    pub fn new(position: usize, title: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            position,
            title: title.into(),
            id: track_id(&url),
            url,
        }
    }

    pub fn tag(&self) -> TrackTag {
        TrackTag {
            position: self.position,
            id: self.id.clone(),
        }
    }
}

/// A track the reader has scheduled: its input length is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Reader sequence number, monotonic since the last stop.
    pub seq: u64,
    pub tag: TrackTag,
    pub title: String,
    /// Total compressed input length in bytes.
    pub length: u64,
    pub container: ContainerFormat,
}

/// A track the decoder has found stream info for, queued for the player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayTrack {
    pub seq: u64,
    pub tag: TrackTag,
    pub format: PcmFormat,
    /// Total PCM bytes; set once decoding of the track finished or was abandoned.
    pub decoded_len: Option<u64>,
}

/// Stable identifier for a track URL.
pub fn track_id(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Lowercase file extension of the URL path, ignoring query and fragment.
pub fn infer_ext_from_url(url: &str) -> Option<String> {
    let tail = url.split(['?', '#']).next().unwrap_or(url);
    let file = tail.rsplit('/').next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}

/// Container format implied by the URL, if supported.
pub fn container_for_url(url: &str) -> Option<ContainerFormat> {
    infer_ext_from_url(url).and_then(|ext| ContainerFormat::from_extension(&ext))
}
