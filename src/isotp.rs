//! ISO 15765-2 transport layer (classical addressing, 8-byte frames)
//!
//! Fragments outgoing payloads of up to 4095 bytes across First and
//! Consecutive frames, reassembles incoming ones, and drives Flow Control
//! in both directions. Frames are padded to 8 bytes with 0x00 on transmit.
//!
//! Frame types live in the high nibble of byte 0:
//!
//! | Type | Nibble | Layout |
//! |------|--------|--------|
//! | Single Frame | 0x0 | low nibble = length 1..7, payload follows |
//! | First Frame | 0x1 | low nibble + byte 1 = 12-bit total length, 6 payload bytes |
//! | Consecutive Frame | 0x2 | low nibble = sequence 0..15 (starts at 1), up to 7 payload bytes |
//! | Flow Control | 0x3 | low nibble = flag, byte 1 = BS, byte 2 = STmin |

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::DiagResult;
use crate::channel::{CanFrame, FrameChannel};
use crate::config::SequencePolicy;
use crate::error::DiagnosticError;

/// Largest payload a 12-bit First Frame length field can describe
pub const MAX_PAYLOAD: usize = 4095;

/// Queue poll interval while waiting for a frame
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const FRAME_SINGLE: u8 = 0x0;
const FRAME_FIRST: u8 = 0x1;
const FRAME_CONSECUTIVE: u8 = 0x2;
const FRAME_FLOW_CONTROL: u8 = 0x3;

const FC_CONTINUE: u8 = 0x0;
const FC_WAIT: u8 = 0x1;
const FC_OVERFLOW: u8 = 0x2;

pub(crate) fn single_frame(payload: &[u8]) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = (FRAME_SINGLE << 4) | payload.len() as u8;
    frame[1..1 + payload.len()].copy_from_slice(payload);
    frame
}

pub(crate) fn first_frame(total_len: usize, head: &[u8]) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = (FRAME_FIRST << 4) | ((total_len >> 8) & 0x0F) as u8;
    frame[1] = (total_len & 0xFF) as u8;
    frame[2..2 + head.len()].copy_from_slice(head);
    frame
}

pub(crate) fn consecutive_frame(sequence: u8, chunk: &[u8]) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = (FRAME_CONSECUTIVE << 4) | (sequence & 0x0F);
    frame[1..1 + chunk.len()].copy_from_slice(chunk);
    frame
}

pub(crate) fn flow_control_frame(flag: u8, block_size: u8, st_min: u8) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = (FRAME_FLOW_CONTROL << 4) | (flag & 0x0F);
    frame[1] = block_size;
    frame[2] = st_min;
    frame
}

/// Decodes an STmin byte per ISO 15765-2. Values 0x00..0x7F are
/// milliseconds; 0xF1..0xF9 are 100..900 microseconds, which we round up
/// to 1 ms since we do not schedule below millisecond granularity.
/// Reserved values fall back to the maximum of 127 ms.
pub(crate) fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_millis(1),
        _ => Duration::from_millis(0x7F),
    }
}

/// Settings applied to one ISO-TP link
#[derive(Debug, Copy, Clone)]
pub struct IsotpSettings {
    /// Block size advertised in our Flow Control frames
    pub block_size: u8,
    /// STmin advertised in our Flow Control frames
    pub st_min: u8,
    /// Per-frame wait timeout in milliseconds, also the default receive
    /// timeout
    pub timeout_ms: u32,
    /// Consecutive Frame sequence checking policy
    pub sequence_policy: SequencePolicy,
}

impl Default for IsotpSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            timeout_ms: 1000,
            sequence_policy: SequencePolicy::Lenient,
        }
    }
}

/// A (request ID, response ID) ISO-TP pairing over a frame transport
///
/// Holds no reassembly state between calls: a timeout or protocol error
/// discards everything, the next request starts clean.
#[derive(Debug, Clone)]
pub struct IsotpLink {
    channel: Arc<dyn FrameChannel>,
    request_id: u32,
    response_id: u32,
    settings: IsotpSettings,
}

impl IsotpLink {
    /// Creates a link sending on `request_id` and listening on `response_id`
    pub fn new(
        channel: Arc<dyn FrameChannel>,
        request_id: u32,
        response_id: u32,
        settings: IsotpSettings,
    ) -> Self {
        log::debug!(
            "ISO-TP link created, request 0x{request_id:03X}, response 0x{response_id:03X}"
        );
        Self {
            channel,
            request_id,
            response_id,
            settings,
        }
    }

    /// The CAN ID requests are sent on
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// The CAN ID responses arrive on
    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Sends one payload, segmenting into FF + CFs when it exceeds a
    /// Single Frame
    pub fn send(&self, payload: &[u8]) -> DiagResult<()> {
        if payload.is_empty() {
            return Err(DiagnosticError::data("empty ISO-TP payload"));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(DiagnosticError::data(format!(
                "ISO-TP payload of {} bytes exceeds the {MAX_PAYLOAD} byte maximum",
                payload.len()
            )));
        }
        if payload.len() <= 7 {
            log::debug!("SF send: {payload:02X?}");
            return self.send_raw(single_frame(payload));
        }
        self.send_multi_frame(payload)
    }

    fn send_multi_frame(&self, payload: &[u8]) -> DiagResult<()> {
        log::debug!("FF send, total {} bytes", payload.len());
        self.send_raw(first_frame(payload.len(), &payload[..6]))?;

        let st_min = self.wait_for_flow_control()?;

        let mut sequence: u8 = 1;
        for chunk in payload[6..].chunks(7) {
            self.send_raw(consecutive_frame(sequence, chunk))?;
            sequence = (sequence + 1) & 0x0F;
            if !st_min.is_zero() {
                std::thread::sleep(st_min);
            }
        }
        Ok(())
    }

    /// Waits for a Flow Control frame after a First Frame. Returns the
    /// STmin to honor between Consecutive Frames. FC wait extends the
    /// deadline; FC overflow aborts.
    fn wait_for_flow_control(&self) -> DiagResult<Duration> {
        let mut deadline = Instant::now() + Duration::from_millis(self.settings.timeout_ms as u64);
        loop {
            if self.channel.is_closing() {
                return Err(DiagnosticError::connection(
                    "channel closed while waiting for flow control",
                ));
            }
            while let Some(data) = self.channel.poll_frame(self.response_id) {
                if data.is_empty() || data[0] >> 4 != FRAME_FLOW_CONTROL {
                    log::debug!("ignoring non-FC frame while awaiting flow control: {data:02X?}");
                    continue;
                }
                let flag = data[0] & 0x0F;
                let block_size = data.get(1).copied().unwrap_or(0);
                let st_min = data.get(2).copied().unwrap_or(0);
                log::debug!("FC received: flag={flag}, BS={block_size}, STmin=0x{st_min:02X}");
                match flag {
                    FC_CONTINUE => return Ok(decode_st_min(st_min)),
                    FC_WAIT => {
                        deadline = Instant::now()
                            + Duration::from_millis(self.settings.timeout_ms as u64);
                    }
                    FC_OVERFLOW => {
                        return Err(DiagnosticError::protocol(
                            "receiver reported flow control overflow",
                        ));
                    }
                    other => {
                        return Err(DiagnosticError::protocol(format!(
                            "reserved flow control flag 0x{other:X}"
                        )));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(DiagnosticError::timeout(format!(
                    "no flow control within {} ms",
                    self.settings.timeout_ms
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Receives one payload. A `timeout_ms` of 0 substitutes the configured
    /// default. The timeout covers the whole transfer including every
    /// Consecutive Frame.
    pub fn receive(&self, timeout_ms: u32) -> DiagResult<Vec<u8>> {
        let timeout = if timeout_ms == 0 {
            self.settings.timeout_ms
        } else {
            timeout_ms
        };
        let deadline = Instant::now() + Duration::from_millis(timeout as u64);
        loop {
            if self.channel.is_closing() {
                return Err(DiagnosticError::connection(
                    "channel closed while waiting for a response",
                ));
            }
            while let Some(data) = self.channel.poll_frame(self.response_id) {
                if data.is_empty() {
                    continue;
                }
                match data[0] >> 4 {
                    FRAME_SINGLE => {
                        let len = (data[0] & 0x0F) as usize;
                        if len == 0 || len > 7 {
                            return Err(DiagnosticError::data(format!(
                                "invalid single frame length {len}"
                            )));
                        }
                        if data.len() < 1 + len {
                            return Err(DiagnosticError::data("truncated single frame"));
                        }
                        log::debug!("SF received: {:02X?}", &data[1..1 + len]);
                        return Ok(data[1..1 + len].to_vec());
                    }
                    FRAME_FIRST => {
                        return self.receive_multi_frame(&data, deadline);
                    }
                    other => {
                        log::debug!("ignoring frame type 0x{other:X} while awaiting a response");
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(DiagnosticError::timeout(format!(
                    "no ISO-TP response within {timeout} ms"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn receive_multi_frame(&self, first: &[u8], deadline: Instant) -> DiagResult<Vec<u8>> {
        if first.len() < 2 {
            return Err(DiagnosticError::data("truncated first frame"));
        }
        let total = (((first[0] & 0x0F) as usize) << 8) | first[1] as usize;
        if total < 8 {
            return Err(DiagnosticError::data(format!(
                "first frame declares {total} bytes, minimum multi-frame length is 8"
            )));
        }
        log::debug!("FF received, total {total} bytes");

        let mut payload = Vec::with_capacity(total);
        payload.extend_from_slice(&first[2..first.len().min(8)]);

        // Tell the ECU to proceed with our BS / STmin
        self.send_raw(flow_control_frame(
            FC_CONTINUE,
            self.settings.block_size,
            self.settings.st_min,
        ))?;

        let mut expected_sequence: u8 = 1;
        while payload.len() < total {
            if self.channel.is_closing() {
                return Err(DiagnosticError::connection(
                    "channel closed during reassembly",
                ));
            }
            if Instant::now() >= deadline {
                return Err(DiagnosticError::timeout(format!(
                    "reassembly stalled at {}/{total} bytes",
                    payload.len()
                )));
            }
            let Some(data) = self.channel.poll_frame(self.response_id) else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };
            if data.is_empty() || data[0] >> 4 != FRAME_CONSECUTIVE {
                log::debug!("ignoring non-CF frame during reassembly: {data:02X?}");
                continue;
            }
            let sequence = data[0] & 0x0F;
            if sequence != expected_sequence {
                match self.settings.sequence_policy {
                    SequencePolicy::Strict => {
                        return Err(DiagnosticError::protocol(format!(
                            "consecutive frame out of order: expected {expected_sequence}, got {sequence}"
                        )));
                    }
                    SequencePolicy::Lenient => {
                        log::warn!(
                            "consecutive frame out of order: expected {expected_sequence}, got {sequence}"
                        );
                    }
                }
            }
            let remaining = total - payload.len();
            let take = remaining.min(7).min(data.len().saturating_sub(1));
            payload.extend_from_slice(&data[1..1 + take]);
            expected_sequence = (expected_sequence + 1) & 0x0F;
            log::debug!("CF #{sequence}: +{take} bytes, {}/{total}", payload.len());
        }
        payload.truncate(total);
        log::debug!("reassembly complete, {total} bytes");
        Ok(payload)
    }

    fn send_raw(&self, frame: [u8; 8]) -> DiagResult<()> {
        self.channel.send_frame(CanFrame::new(
            self.request_id,
            &frame,
            self.request_id > 0x7FF,
        ))
    }
}
