//! Test doubles shared by the pipeline's unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use anyhow::{Result, bail};
use gapless_types::PcmFormat;

use crate::codec::{Codec, DecodeStatus, StreamInfo, SyncSearch};
use crate::http::HttpTarget;
use crate::net::{Connection, Connector};
use crate::pipeline::PlayerEvents;
use crate::sink::{AudioSink, SinkReady};

/// One scripted outcome of a `read` call.
#[derive(Clone, Debug)]
pub enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Close,
}

#[derive(Default)]
struct NetState {
    scripts: VecDeque<Vec<ReadStep>>,
    requests: Vec<String>,
    targets: Vec<String>,
    live: usize,
    max_live: usize,
}

/// Connector handing out scripted connections in order; refuses once the script runs out.
#[derive(Clone, Default)]
pub struct MockNet(Rc<RefCell<NetState>>);

impl MockNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, steps: Vec<ReadStep>) {
        self.0.borrow_mut().scripts.push_back(steps);
    }

    /// Request text written on each connection, in connect order.
    pub fn requests(&self) -> Vec<String> {
        self.0.borrow().requests.clone()
    }

    /// URL each connection was opened for.
    pub fn targets(&self) -> Vec<String> {
        self.0.borrow().targets.clone()
    }

    pub fn live(&self) -> usize {
        self.0.borrow().live
    }

    pub fn max_live(&self) -> usize {
        self.0.borrow().max_live
    }
}

impl Connector for MockNet {
    fn connect(&mut self, target: &HttpTarget) -> Result<Box<dyn Connection>> {
        let mut state = self.0.borrow_mut();
        let Some(steps) = state.scripts.pop_front() else {
            bail!("connection refused");
        };
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.targets.push(target.as_str().to_string());
        state.requests.push(String::new());
        let index = state.requests.len() - 1;
        Ok(Box::new(MockConn {
            steps: steps.into(),
            request: Vec::new(),
            index,
            net: self.clone(),
        }))
    }
}

struct MockConn {
    steps: VecDeque<ReadStep>,
    request: Vec<u8>,
    index: usize,
    net: MockNet,
}

impl Read for MockConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(ReadStep::Close) => {
                self.steps.push_front(ReadStep::Close);
                Ok(0)
            }
            Some(ReadStep::WouldBlock) | None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for MockConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.request.extend_from_slice(buf);
        self.net.0.borrow_mut().requests[self.index] =
            String::from_utf8_lossy(&self.request).into_owned();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockConn {
    fn drop(&mut self) {
        self.net.0.borrow_mut().live -= 1;
    }
}

/// Raw HTTP response bytes.
pub fn http_response(status: u16, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} X\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub fn ok_response(body: &[u8]) -> Vec<u8> {
    http_response(200, &[("Content-Length", body.len().to_string())], body)
}

/// `206` response carrying `body` from `offset` of a `total`-byte resource.
pub fn partial_response(body: &[u8], offset: usize, total: usize) -> Vec<u8> {
    let end = offset + body.len() - 1;
    http_response(
        206,
        &[
            ("Content-Range", format!("bytes {offset}-{end}/{total}")),
            ("Content-Length", body.len().to_string()),
        ],
        body,
    )
}

pub fn redirect_response(location: &str) -> Vec<u8> {
    http_response(302, &[("Location", location.to_string())], b"")
}

/// Deterministic test payload.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub const ECHO_FORMAT: PcmFormat = PcmFormat {
    sample_rate: 44_100,
    bits_per_sample: 16,
    channels: 2,
};

/// Codec that "decodes" by copying its input to the output, whole frames at a time.
pub struct EchoCodec {
    input: Vec<u8>,
    capacity: usize,
    synced: bool,
    pub inits: usize,
}

impl EchoCodec {
    pub fn new() -> Self {
        Self {
            input: Vec::new(),
            capacity: 4096,
            synced: false,
            inits: 0,
        }
    }
}

impl Codec for EchoCodec {
    fn init(&mut self) -> Result<()> {
        self.inits += 1;
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        self.input.clear();
        self.synced = false;
    }

    fn write_free(&self) -> usize {
        self.capacity - self.input.len()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.write_free());
        self.input.extend_from_slice(&data[..n]);
        n
    }

    fn buffered(&self) -> usize {
        self.input.len()
    }

    fn start(&mut self) -> SyncSearch {
        if self.input.is_empty() {
            SyncSearch::NotFound { skipped: 0 }
        } else {
            self.synced = true;
            SyncSearch::Found { skipped: 0 }
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.synced.then_some(StreamInfo {
            channels: ECHO_FORMAT.channels,
            sample_rate: ECHO_FORMAT.sample_rate,
            bits_per_sample: ECHO_FORMAT.bits_per_sample,
            bitrate: None,
        })
    }

    fn decode(&mut self, out: &mut [u8]) -> DecodeStatus {
        let n = self.input.len().min(out.len()) / 4 * 4;
        if n == 0 {
            return DecodeStatus::NeedMoreData { bytes_consumed: 0 };
        }
        out[..n].copy_from_slice(&self.input[..n]);
        self.input.drain(..n);
        DecodeStatus::Success {
            bytes_consumed: n,
            samples_produced: n / 2,
        }
    }
}

/// How a [`ScriptedCodec`] misbehaves on one track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecFault {
    /// Behave like [`EchoCodec`].
    None,
    /// Never sync; scanned input is dropped.
    NoSync,
    /// Never sync and keep every scanned byte.
    NoSyncKeepInput,
    /// Decode this many units, then report the stream corrupt.
    CorruptAfter(usize),
    /// Sync, but never assemble a complete frame.
    NeverCompletes,
}

/// [`EchoCodec`] with a per-track fault, taken in order at each `init`.
pub struct ScriptedCodec {
    echo: EchoCodec,
    faults: VecDeque<CodecFault>,
    fault: CodecFault,
    decodes: usize,
}

impl ScriptedCodec {
    pub fn new(faults: impl IntoIterator<Item = CodecFault>) -> Self {
        Self {
            echo: EchoCodec::new(),
            faults: faults.into_iter().collect(),
            fault: CodecFault::None,
            decodes: 0,
        }
    }
}

impl Codec for ScriptedCodec {
    fn init(&mut self) -> Result<()> {
        self.fault = self.faults.pop_front().unwrap_or(CodecFault::None);
        self.decodes = 0;
        self.echo.init()
    }

    fn close(&mut self) {
        self.echo.close();
    }

    fn write_free(&self) -> usize {
        self.echo.write_free()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.echo.write(data)
    }

    fn buffered(&self) -> usize {
        self.echo.buffered()
    }

    fn start(&mut self) -> SyncSearch {
        match self.fault {
            CodecFault::NoSync => {
                let skipped = self.echo.input.len();
                self.echo.input.clear();
                SyncSearch::NotFound { skipped }
            }
            CodecFault::NoSyncKeepInput => SyncSearch::NotFound { skipped: 0 },
            _ => self.echo.start(),
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.echo.stream_info()
    }

    fn decode(&mut self, out: &mut [u8]) -> DecodeStatus {
        match self.fault {
            CodecFault::CorruptAfter(n) if self.decodes >= n => DecodeStatus::Corrupt,
            CodecFault::NeverCompletes => DecodeStatus::NeedMoreData { bytes_consumed: 0 },
            _ => {
                self.decodes += 1;
                self.echo.decode(out)
            }
        }
    }
}

/// Sink recording everything written.
///
/// By default the ready flag is re-armed by each write and output drains at once. A sink
/// built with [`MockSink::with_completion`] keeps written chunks in flight until
/// [`MockSink::complete`] plays one back.
pub struct MockSink {
    pub configured: Vec<PcmFormat>,
    pub written: Vec<u8>,
    pub deinits: usize,
    /// Calls in order, with the bytes still in flight at the time.
    pub log: Vec<String>,
    format: Option<PcmFormat>,
    ready: SinkReady,
    manual_completion: bool,
    in_flight: VecDeque<usize>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            configured: Vec::new(),
            written: Vec::new(),
            deinits: 0,
            log: Vec::new(),
            format: None,
            ready: SinkReady::new(),
            manual_completion: false,
            in_flight: VecDeque::new(),
        }
    }

    pub fn with_completion() -> Self {
        Self {
            manual_completion: true,
            ..Self::new()
        }
    }

    fn in_flight_bytes(&self) -> usize {
        self.in_flight.iter().sum()
    }

    /// Finish playing the oldest chunk and raise the ready flag. `false` if none was queued.
    pub fn complete(&mut self) -> bool {
        if self.in_flight.pop_front().is_none() {
            return false;
        }
        self.ready.set();
        true
    }
}

impl AudioSink for MockSink {
    fn configure(&mut self, format: PcmFormat) -> Result<()> {
        self.log
            .push(format!("configure in_flight={}", self.in_flight_bytes()));
        self.in_flight.clear();
        self.configured.push(format);
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
        self.log.push(format!("write {}", pcm.len()));
        self.written.extend_from_slice(pcm);
        if self.manual_completion {
            self.in_flight.push_back(pcm.len());
        } else {
            self.ready.set();
        }
        Ok(())
    }

    fn drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn deinit(&mut self) {
        self.log
            .push(format!("deinit in_flight={}", self.in_flight_bytes()));
        self.in_flight.clear();
        self.deinits += 1;
        self.format = None;
        self.ready.clear();
    }
}

/// Callback sink capturing messages and display updates.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    pub messages: Rc<RefCell<Vec<String>>>,
    pub displays: Rc<RefCell<Vec<(String, String)>>>,
}

impl PlayerEvents for RecordingEvents {
    fn on_display_update(&mut self, current: &str, next: &str) {
        self.displays
            .borrow_mut()
            .push((current.to_string(), next.to_string()));
    }

    fn on_message(&mut self, text: &str) {
        self.messages.borrow_mut().push(text.to_string());
    }
}

/// ADTS header (AAC-LC, no CRC) for a frame of `frame_len` bytes.
pub fn adts_header(frame_len: usize, sample_rate_index: u8, channels: u8) -> Vec<u8> {
    let profile = 1u8;
    vec![
        0xFF,
        0xF1,
        (profile << 6) | (sample_rate_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
        (frame_len >> 3) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ]
}

/// One silent AAC-LC mono frame at 44.1 kHz with its ADTS header.
///
/// The raw block is a single channel element with no scale factor bands, then the end tag.
pub fn silent_adts_frame() -> Vec<u8> {
    const RAW: [u8; 4] = [0x01, 0x40, 0x20, 0x07];
    let mut frame = adts_header(7 + RAW.len(), 4, 1);
    frame.extend_from_slice(&RAW);
    frame
}

/// MPEG transport stream packet builders.
pub mod ts {
    use crate::demux::PACKET_SIZE;

    pub const PMT_PID: u16 = 0x100;
    pub const AUDIO_PID: u16 = 0x101;

    /// Wrap `payload` (at most 184 bytes) in a packet, padding with adaptation stuffing.
    fn packet(pid: u16, unit_start: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= PACKET_SIZE - 4);
        let mut p = vec![
            0x47,
            (if unit_start { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
        ];
        let stuffing = PACKET_SIZE - 4 - payload.len();
        if stuffing == 0 {
            p.push(0x10);
        } else {
            p.push(0x30);
            let adaptation_len = stuffing - 1;
            p.push(adaptation_len as u8);
            if adaptation_len > 0 {
                p.push(0x00);
                p.extend(std::iter::repeat_n(0xFF, adaptation_len - 1));
            }
        }
        p.extend_from_slice(payload);
        assert_eq!(p.len(), PACKET_SIZE);
        p
    }

    fn psi(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(section);
        payload.resize(PACKET_SIZE - 4, 0xFF);
        packet(pid, true, &payload)
    }

    pub fn pat() -> Vec<u8> {
        let section = [
            0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01,
            0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8, 0xDE, 0xAD, 0xBE, 0xEF,
        ];
        psi(0, &section)
    }

    pub fn pmt() -> Vec<u8> {
        let section = [
            0x02, 0xB0, 18, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00,
            0x0F, 0xE0 | (AUDIO_PID >> 8) as u8, AUDIO_PID as u8, 0xF0, 0x00,
            0xDE, 0xAD, 0xBE, 0xEF,
        ];
        psi(PMT_PID, &section)
    }

    pub fn null_packet() -> Vec<u8> {
        packet(0x1FFF, false, &[0xFF; 184])
    }

    fn pes_header(payload_len: usize, bounded: bool, with_pts: bool) -> Vec<u8> {
        let header_data = if with_pts { 5 } else { 0 };
        let pes_len = if bounded { 3 + header_data + payload_len } else { 0 };
        let mut h = vec![
            0x00,
            0x00,
            0x01,
            0xC0,
            (pes_len >> 8) as u8,
            pes_len as u8,
            0x80,
            if with_pts { 0x80 } else { 0x00 },
            header_data as u8,
        ];
        if with_pts {
            h.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]);
        }
        h
    }

    /// One PES unit carrying `payload`, split over as many packets as needed.
    pub fn pes_packets(payload: &[u8], bounded: bool) -> Vec<Vec<u8>> {
        let mut unit = pes_header(payload.len(), bounded, true);
        unit.extend_from_slice(payload);
        unit.chunks(PACKET_SIZE - 4)
            .enumerate()
            .map(|(i, chunk)| packet(AUDIO_PID, i == 0, chunk))
            .collect()
    }

    /// A single packet starting a PES unit whose body is `body` verbatim.
    pub fn pes_start_packet_raw(body: &[u8], bounded: bool) -> Vec<u8> {
        let mut unit = pes_header(body.len(), bounded, false);
        unit.extend_from_slice(body);
        packet(AUDIO_PID, true, &unit)
    }

    /// Complete stream: tables followed by `payload` split into PES units of `unit_len`.
    pub fn stream(payload: &[u8], unit_len: usize) -> Vec<u8> {
        let mut out = pat();
        out.extend(pmt());
        for unit in payload.chunks(unit_len) {
            for p in pes_packets(unit, true) {
                out.extend(p);
            }
        }
        out
    }
}
