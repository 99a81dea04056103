//! Simulated ECU transport for unit testing the protocol stack without
//! adapter hardware
//!
//! [SimulationFrameChannel] sits behind the [FrameChannel] seam and behaves
//! like an ECU on the wire: it reassembles client requests (Single Frame or
//! First Frame + Consecutive Frames), looks the assembled payload up in a
//! scripted request/response map and answers with properly segmented
//! frames, driving Flow Control in both directions. Every frame the client
//! transmits is recorded for byte-level assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::DiagResult;
use crate::channel::{
    CanFrame, DiagChannel, DiagDevice, DiagInterface, FrameChannel, FrameQueue,
};
use crate::config::{DiagConfig, RetryPolicy};
use crate::error::ErrorHandler;

/// How the simulated ECU answers the client's First Frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimFlowControl {
    /// Flow Control "continue to send" with the given BS and STmin
    ContinueToSend {
        /// Advertised block size
        block_size: u8,
        /// Advertised minimum separation time
        st_min: u8,
    },
    /// One "wait" frame first, then "continue to send"
    WaitThenContinue,
    /// Flow Control "overflow", aborting the transfer
    Overflow,
    /// No Flow Control at all; the client is expected to time out
    Silent,
}

#[derive(Debug)]
struct RequestAssembly {
    total: usize,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    responses: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    sent: Vec<CanFrame>,
    flow_control: SimFlowControl,
    assembly: Option<RequestAssembly>,
    pending_cfs: VecDeque<Vec<u8>>,
    filters: Vec<(u32, u32)>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            sent: Vec::new(),
            flow_control: SimFlowControl::ContinueToSend {
                block_size: 0,
                st_min: 0,
            },
            assembly: None,
            pending_cfs: VecDeque::new(),
            filters: Vec::new(),
        }
    }
}

/// Scripted ECU behind the [FrameChannel] seam
#[derive(Debug)]
pub struct SimulationFrameChannel {
    request_id: u32,
    response_id: u32,
    state: Mutex<SimState>,
    rx: FrameQueue,
    closing: AtomicBool,
}

impl SimulationFrameChannel {
    /// Creates a simulated ECU listening on `request_id` and answering on
    /// `response_id`
    pub fn new(request_id: u32, response_id: u32) -> Self {
        Self {
            request_id,
            response_id,
            state: Mutex::new(SimState::default()),
            rx: FrameQueue::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Scripts one response payload for a request payload. The last
    /// scripted response repeats on every further matching request.
    pub fn add_response(&self, request: &[u8], response: &[u8]) {
        self.add_response_sequence(request, &[response]);
    }

    /// Scripts a sequence of response payloads delivered one per matching
    /// request transfer (e.g. "response pending" followed by the real
    /// answer)
    pub fn add_response_sequence(&self, request: &[u8], responses: &[&[u8]]) {
        let mut state = self.state.lock().unwrap();
        let queue = state.responses.entry(request.to_vec()).or_default();
        for r in responses {
            queue.push_back(r.to_vec());
        }
    }

    /// Changes how the ECU reacts to a client First Frame
    pub fn set_flow_control(&self, mode: SimFlowControl) {
        self.state.lock().unwrap().flow_control = mode;
    }

    /// Every frame the client transmitted so far, in order
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Pushes a raw frame onto the response ID, bypassing the scripted map.
    /// Used to hand-craft malformed traffic.
    pub fn inject_frame(&self, data: &[u8]) {
        self.rx.push(self.response_id, data.to_vec());
    }

    /// Flags the channel as shutting down
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    /// Reverts a shutdown and drops queued frames, like a freshly
    /// connected channel. Scripted responses, installed filters and the
    /// sent-frame log survive for assertions.
    pub fn reset(&self) {
        self.closing.store(false, Ordering::Relaxed);
        self.rx.clear();
    }

    /// Every (request, response) filter pair installed so far, in order
    pub fn installed_filters(&self) -> Vec<(u32, u32)> {
        self.state.lock().unwrap().filters.clone()
    }

    fn pad(mut frame: Vec<u8>) -> Vec<u8> {
        frame.resize(8, 0x00);
        frame
    }

    /// Answers an assembled request payload. A scripted "response pending"
    /// (7F xx 78) with a follow-up entry behind it delivers both, the way a
    /// busy ECU does. A drained script keeps repeating its final response.
    fn respond(&self, state: &mut SimState, request: &[u8]) {
        loop {
            let (payload, follow_up) = {
                let Some(queue) = state.responses.get_mut(request) else {
                    return;
                };
                let Some(payload) = queue.pop_front() else {
                    return;
                };
                let follow_up = payload.len() == 3
                    && payload[0] == 0x7F
                    && payload[2] == 0x78
                    && !queue.is_empty();
                if queue.is_empty() {
                    queue.push_back(payload.clone());
                }
                (payload, follow_up)
            };
            self.emit_response(state, &payload);
            if !follow_up {
                return;
            }
        }
    }

    /// Segments one response payload onto the wire. Multi-frame responses
    /// queue their Consecutive Frames until the client's Flow Control
    /// arrives.
    fn emit_response(&self, state: &mut SimState, payload: &[u8]) {
        if payload.len() <= 7 {
            let mut sf = vec![payload.len() as u8];
            sf.extend_from_slice(payload);
            self.rx.push(self.response_id, Self::pad(sf));
            return;
        }

        let mut ff = vec![
            0x10 | ((payload.len() >> 8) & 0x0F) as u8,
            (payload.len() & 0xFF) as u8,
        ];
        ff.extend_from_slice(&payload[..6]);
        self.rx.push(self.response_id, ff);

        let mut sequence: u8 = 1;
        for chunk in payload[6..].chunks(7) {
            let mut cf = vec![0x20 | sequence];
            cf.extend_from_slice(chunk);
            state.pending_cfs.push_back(Self::pad(cf));
            sequence = (sequence + 1) & 0x0F;
        }
    }
}

impl FrameChannel for SimulationFrameChannel {
    fn send_frame(&self, frame: CanFrame) -> DiagResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(frame);
        if frame.get_address() != self.request_id {
            return Ok(());
        }
        let data = frame.get_data();
        if data.is_empty() {
            return Ok(());
        }
        match data[0] >> 4 {
            // Single Frame request
            0x0 => {
                let len = (data[0] & 0x0F) as usize;
                if len >= 1 && data.len() > len {
                    let request = data[1..1 + len].to_vec();
                    self.respond(&mut state, &request);
                }
            }
            // First Frame: note the expected length and answer with FC
            0x1 => {
                if data.len() >= 2 {
                    let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                    state.assembly = Some(RequestAssembly {
                        total,
                        data: data[2..].to_vec(),
                    });
                    match state.flow_control {
                        SimFlowControl::ContinueToSend { block_size, st_min } => {
                            self.rx.push(
                                self.response_id,
                                Self::pad(vec![0x30, block_size, st_min]),
                            );
                        }
                        SimFlowControl::WaitThenContinue => {
                            self.rx.push(self.response_id, Self::pad(vec![0x31, 0, 0]));
                            self.rx.push(self.response_id, Self::pad(vec![0x30, 0, 0]));
                        }
                        SimFlowControl::Overflow => {
                            self.rx.push(self.response_id, Self::pad(vec![0x32, 0, 0]));
                        }
                        SimFlowControl::Silent => {}
                    }
                }
            }
            // Consecutive Frame of a client request
            0x2 => {
                let complete = if let Some(assembly) = state.assembly.as_mut() {
                    let remaining = assembly.total.saturating_sub(assembly.data.len());
                    let take = remaining.min(7).min(data.len().saturating_sub(1));
                    assembly.data.extend_from_slice(&data[1..1 + take]);
                    assembly.data.len() >= assembly.total
                } else {
                    false
                };
                if complete {
                    if let Some(assembly) = state.assembly.take() {
                        let mut request = assembly.data;
                        request.truncate(assembly.total);
                        self.respond(&mut state, &request);
                    }
                }
            }
            // Client Flow Control: release the queued Consecutive Frames
            0x3 => {
                if data[0] & 0x0F == 0x0 {
                    while let Some(cf) = state.pending_cfs.pop_front() {
                        self.rx.push(self.response_id, cf);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn poll_frame(&self, can_id: u32) -> Option<Vec<u8>> {
        self.rx.pop(can_id)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }
}

impl DiagChannel for SimulationFrameChannel {
    fn set_flow_control_filter(&self, request_id: u32, response_id: u32) -> DiagResult<u32> {
        let mut state = self.state.lock().unwrap();
        state.filters.push((request_id, response_id));
        Ok(state.filters.len() as u32)
    }

    fn clear_buffers(&self) {
        self.rx.clear();
    }

    fn start_drain(&self) {}

    fn shutdown(&self) {
        self.begin_close();
    }
}

/// A simulated opened device handing out the shared scripted channel
#[derive(Debug)]
pub struct SimulationDevice {
    channel: Arc<SimulationFrameChannel>,
}

impl DiagDevice for SimulationDevice {
    type Channel = SimulationFrameChannel;

    fn connect_channel(&self, _cfg: &DiagConfig) -> DiagResult<Arc<SimulationFrameChannel>> {
        self.channel.reset();
        Ok(self.channel.clone())
    }

    fn health_check(&self) -> DiagResult<f32> {
        Ok(12.6)
    }
}

/// A simulated adapter interface, so facade-level tests can run the full
/// connect/verify/disconnect sequence without hardware
#[derive(Debug)]
pub struct SimulationInterface {
    channel: Arc<SimulationFrameChannel>,
}

impl SimulationInterface {
    /// Interface handing out the given scripted channel on every open
    pub fn new(channel: Arc<SimulationFrameChannel>) -> Self {
        Self { channel }
    }
}

impl DiagInterface for SimulationInterface {
    type Device = SimulationDevice;

    fn open_device(
        &self,
        _handler: &ErrorHandler,
        _retry: RetryPolicy,
    ) -> DiagResult<SimulationDevice> {
        Ok(SimulationDevice {
            channel: self.channel.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_a_single_frame_request_with_a_single_frame() {
        let sim = SimulationFrameChannel::new(0x7E0, 0x7E8);
        sim.add_response(&[0x3E, 0x00], &[0x7E, 0x00]);
        sim.send_frame(CanFrame::new(
            0x7E0,
            &[0x02, 0x3E, 0x00, 0, 0, 0, 0, 0],
            false,
        ))
        .unwrap();
        assert_eq!(
            sim.poll_frame(0x7E8),
            Some(vec![0x02, 0x7E, 0x00, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn holds_consecutive_frames_until_flow_control() {
        let sim = SimulationFrameChannel::new(0x7E0, 0x7E8);
        let response: Vec<u8> = (0..20).collect();
        sim.add_response(&[0x22, 0x12, 0x34], &response);
        sim.send_frame(CanFrame::new(
            0x7E0,
            &[0x03, 0x22, 0x12, 0x34, 0, 0, 0, 0],
            false,
        ))
        .unwrap();

        // FF arrives immediately, CFs only after our FC
        let ff = sim.poll_frame(0x7E8).unwrap();
        assert_eq!(ff[0], 0x10);
        assert_eq!(ff[1], 20);
        assert!(sim.poll_frame(0x7E8).is_none());

        sim.send_frame(CanFrame::new(0x7E0, &[0x30, 0, 0, 0, 0, 0, 0, 0], false))
            .unwrap();
        let cf1 = sim.poll_frame(0x7E8).unwrap();
        assert_eq!(cf1[0], 0x21);
        let cf2 = sim.poll_frame(0x7E8).unwrap();
        assert_eq!(cf2[0], 0x22);
        assert!(sim.poll_frame(0x7E8).is_none());
    }

    #[test]
    fn frames_on_other_ids_are_recorded_but_ignored() {
        let sim = SimulationFrameChannel::new(0x7E0, 0x7E8);
        sim.add_response(&[0x3E, 0x00], &[0x7E, 0x00]);
        sim.send_frame(CanFrame::new(
            0x7E1,
            &[0x02, 0x3E, 0x00, 0, 0, 0, 0, 0],
            false,
        ))
        .unwrap();
        assert!(sim.poll_frame(0x7E8).is_none());
        assert_eq!(sim.sent_frames().len(), 1);
    }
}
