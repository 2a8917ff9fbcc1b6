//! MPEG transport stream demultiplexer.
//!
//! Extracts the AAC elementary stream from 188-byte packets:
//! - PID 0 carries the program association table, which names the PMT PIDs
//! - a PMT names the elementary stream PID carrying AAC audio
//! - packets on that PID carry PES units whose payload is handed to the codec
//!
//! Only the single audio stream is followed; everything else yields no payload.

use anyhow::{Result, bail};

/// Transport packet size in bytes.
pub const PACKET_SIZE: usize = 188;

const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const NULL_PID: u16 = 0x1FFF;
/// ADTS-framed AAC.
const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
/// LATM-framed AAC.
const STREAM_TYPE_AAC_LATM: u8 = 0x11;

/// How much of the current PES unit is still expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PesRemaining {
    /// No unit in progress; continuation packets are ignored.
    None,
    /// PES length field was zero: the unit runs until the next start.
    Unbounded,
    Bytes(usize),
}

/// Stateful demultiplexer for one track's transport stream.
pub struct TransportDemuxer {
    table_pids: Vec<u16>,
    audio_pid: Option<u16>,
    remaining: PesRemaining,
}

impl Default for TransportDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportDemuxer {
    pub fn new() -> Self {
        Self {
            table_pids: Vec::new(),
            audio_pid: None,
            remaining: PesRemaining::None,
        }
    }

    /// Forget learned PIDs; called at every track start.
    pub fn reset(&mut self) {
        self.table_pids.clear();
        self.audio_pid = None;
        self.remaining = PesRemaining::None;
    }

    pub fn audio_pid(&self) -> Option<u16> {
        self.audio_pid
    }

    /// Demultiplex one packet, writing any audio payload into `out`.
    ///
    /// Returns the number of payload bytes written (0 for table packets, packets on other
    /// PIDs, and adaptation-only packets). `out` must hold at least 184 bytes.
    /// Fails if the packet is not sync-aligned.
    pub fn demux(&mut self, packet: &[u8], out: &mut [u8]) -> Result<usize> {
        if packet.len() != PACKET_SIZE || packet[0] != SYNC_BYTE {
            bail!("transport packet out of sync");
        }
        let unit_start = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut pos = 4;
        if adaptation & 0x02 != 0 {
            pos += 1 + usize::from(packet[4]);
        }
        if adaptation & 0x01 == 0 || pos >= PACKET_SIZE || pid == NULL_PID {
            return Ok(0);
        }
        let payload = &packet[pos..];

        if pid == PAT_PID {
            if let Some(section) = psi_section(payload, unit_start) {
                self.parse_pat(section);
            }
            return Ok(0);
        }
        if self.table_pids.contains(&pid) {
            if let Some(section) = psi_section(payload, unit_start) {
                self.parse_pmt(section);
            }
            return Ok(0);
        }
        if self.audio_pid == Some(pid) {
            return self.take_pes(payload, unit_start, out);
        }
        Ok(0)
    }

    fn parse_pat(&mut self, section: &[u8]) {
        let end = section_end(section);
        let mut i = 8;
        while i + 4 <= end {
            let program = u16::from_be_bytes([section[i], section[i + 1]]);
            let pid = (u16::from(section[i + 2] & 0x1F) << 8) | u16::from(section[i + 3]);
            if program != 0 && !self.table_pids.contains(&pid) {
                tracing::trace!(program, pid, "program map table");
                self.table_pids.push(pid);
            }
            i += 4;
        }
    }

    fn parse_pmt(&mut self, section: &[u8]) {
        if section.len() < 12 {
            return;
        }
        let end = section_end(section);
        let info_len = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
        let mut i = 12 + info_len;
        while i + 5 <= end {
            let stream_type = section[i];
            let pid = (u16::from(section[i + 1] & 0x1F) << 8) | u16::from(section[i + 2]);
            let es_info_len = (usize::from(section[i + 3] & 0x0F) << 8) | usize::from(section[i + 4]);
            if self.audio_pid.is_none()
                && matches!(stream_type, STREAM_TYPE_AAC_ADTS | STREAM_TYPE_AAC_LATM)
            {
                tracing::debug!(pid, stream_type, "audio elementary stream");
                self.audio_pid = Some(pid);
            }
            i += 5 + es_info_len;
        }
    }

    fn take_pes(&mut self, payload: &[u8], unit_start: bool, out: &mut [u8]) -> Result<usize> {
        let mut start = 0;
        if unit_start {
            if payload.len() < 9 || payload[..3] != [0x00, 0x00, 0x01] {
                self.remaining = PesRemaining::None;
                bail!("missing PES start code");
            }
            let stream_id = payload[3];
            if !(0xC0..=0xDF).contains(&stream_id) {
                self.remaining = PesRemaining::None;
                return Ok(0);
            }
            let pes_len = usize::from(u16::from_be_bytes([payload[4], payload[5]]));
            start = (9 + usize::from(payload[8])).min(payload.len());
            if let Some(tag_len) = id3_tag_len(&payload[start..]) {
                start = (start + tag_len).min(payload.len());
            }
            // PES length counts everything after the length field itself.
            self.remaining = if pes_len == 0 {
                PesRemaining::Unbounded
            } else {
                PesRemaining::Bytes(pes_len.saturating_sub(start - 6))
            };
        }

        let body = &payload[start..];
        let n = match self.remaining {
            PesRemaining::None => 0,
            PesRemaining::Unbounded => body.len(),
            PesRemaining::Bytes(left) => left.min(body.len()),
        };
        out[..n].copy_from_slice(&body[..n]);
        if let PesRemaining::Bytes(left) = self.remaining {
            self.remaining = PesRemaining::Bytes(left - n);
        }
        Ok(n)
    }
}

/// Skip the pointer field of a PSI payload that starts a section.
fn psi_section(payload: &[u8], unit_start: bool) -> Option<&[u8]> {
    if !unit_start {
        return None;
    }
    let pointer = usize::from(*payload.first()?);
    payload.get(1 + pointer..)
}

/// End of the section's entry loop (before the CRC), clamped to the packet.
fn section_end(section: &[u8]) -> usize {
    if section.len() < 3 {
        return 0;
    }
    let length = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
    (3 + length).saturating_sub(4).min(section.len())
}

/// Total size of a leading ID3v2 tag (header + synchsafe body size).
fn id3_tag_len(data: &[u8]) -> Option<usize> {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return None;
    }
    let size = data[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7F));
    Some(10 + size)
}
