//! CAN frames, the received-frame queue and the adapter trait seams
//!
//! Two seams separate the protocol stack from real hardware:
//!
//! * [FrameChannel] is the wire-level boundary the ISO-TP engine drives:
//!   send a frame, poll a frame, notice shutdown.
//! * [DiagInterface] / [DiagDevice] / [DiagChannel] are the lifecycle
//!   boundary the session facade drives: open the adapter, connect a
//!   channel, install filters, run the drain task, tear down.
//!
//! [crate::passthru] implements both against a real PassThru adapter,
//! [crate::simulation] against a scripted ECU for tests.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::DiagResult;
use crate::config::{DiagConfig, RetryPolicy};
use crate::error::ErrorHandler;

/// A single classical CAN frame: an 11-bit or 29-bit arbitration ID and up
/// to 8 data bytes. Immutable once constructed.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: [u8; 8],
    dlc: usize,
    extended: bool,
}

impl CanFrame {
    /// Creates a new frame. Data beyond 8 bytes is truncated.
    pub fn new(id: u32, data: &[u8], extended: bool) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            data: buf,
            dlc,
            extended,
        }
    }

    /// The arbitration ID
    pub fn get_address(&self) -> u32 {
        self.id
    }

    /// The data bytes
    pub fn get_data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }

    /// Whether the frame uses a 29-bit arbitration ID
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame 0x{:03X} {:02X?}", self.id, self.get_data())
    }
}

/// Received frame payloads keyed by CAN ID
///
/// The drain task is the only writer; ISO-TP reassembly pops entries.
/// Per-ID ordering is FIFO, matching arrival order from the adapter.
#[derive(Debug, Default)]
pub struct FrameQueue {
    inner: Mutex<HashMap<u32, VecDeque<Vec<u8>>>>,
}

impl FrameQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload received on the given CAN ID
    pub fn push(&self, can_id: u32, payload: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .entry(can_id)
            .or_default()
            .push_back(payload);
    }

    /// Pops the oldest pending payload for the given CAN ID
    pub fn pop(&self, can_id: u32) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get_mut(&can_id)?.pop_front()
    }

    /// Number of pending payloads for the given CAN ID
    pub fn pending(&self, can_id: u32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(&can_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drops everything
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Low-level frame transport used by the ISO-TP engine
pub trait FrameChannel: Send + Sync + fmt::Debug {
    /// Transmits a single frame
    fn send_frame(&self, frame: CanFrame) -> DiagResult<()>;

    /// Pops the oldest pending frame payload received on the given CAN ID.
    /// Returns `None` when nothing is queued; the caller polls.
    fn poll_frame(&self, can_id: u32) -> Option<Vec<u8>>;

    /// True once the channel has begun shutting down. Pollers observe this
    /// and bail out instead of running into their full timeout.
    fn is_closing(&self) -> bool;
}

/// A configured diagnostic channel: the frame transport plus the control
/// surface the session facade drives during bring-up and teardown
pub trait DiagChannel: FrameChannel {
    /// Installs the ISO-TP flow-control filter for the given ID pair,
    /// stopping any previously installed filter first. Returns the filter
    /// handle.
    fn set_flow_control_filter(&self, request_id: u32, response_id: u32) -> DiagResult<u32>;

    /// Clears transmit/receive buffers and locally queued frames.
    /// Best-effort; failures never propagate.
    fn clear_buffers(&self);

    /// Starts the background task pumping received frames into the per-ID
    /// queue
    fn start_drain(&self);

    /// Stops the drain task, removes the filter and closes the channel.
    /// Harmless to call twice.
    fn shutdown(&self);
}

/// An opened diagnostic adapter
pub trait DiagDevice: Send + fmt::Debug {
    /// Channel type produced by [DiagDevice::connect_channel]
    type Channel: DiagChannel + 'static;

    /// Connects a channel per the configuration. The handle is shared:
    /// the drain task, the ISO-TP link and the facade all hold it.
    fn connect_channel(&self, cfg: &DiagConfig) -> DiagResult<Arc<Self::Channel>>;

    /// Liveness probe run before a fresh connection is declared good.
    /// Returns the battery voltage where the adapter reports one.
    fn health_check(&self) -> DiagResult<f32>;
}

/// An adapter interface able to open devices. The session facade is generic
/// over this, so tests can drive the full bring-up against the simulation.
pub trait DiagInterface: fmt::Debug {
    /// Device type produced by [DiagInterface::open_device]
    type Device: DiagDevice;

    /// Opens the device, retrying transient hardware failures per `retry`
    fn open_device(&self, handler: &ErrorHandler, retry: RetryPolicy) -> DiagResult<Self::Device>;
}
