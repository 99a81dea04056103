//! SAE J2534 (PassThru) adapter access
//!
//! This module owns the lifecycle of the physical link: it loads the vendor
//! function library, opens the device, connects an ISO15765 channel at the
//! configured bitrate, installs the flow-control filter and runs the
//! background drain task that copies every received frame into the per-ID
//! [FrameQueue]. Everything above this module deals in [CanFrame]s only.
//!
//! Wire format note: a `PASSTHRU_MSG` carries the 4-byte big-endian
//! arbitration ID followed by the frame payload, so `data_size` is always
//! payload length + 4. This layout is fixed by the J2534 API and must stay
//! byte-exact.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use j2534_rust::{
    ConnectFlags, FilterType, IoctlID, PASSTHRU_MSG, PassthruError, Protocol, RxFlag, TxFlag,
};

use crate::DiagResult;
use crate::channel::{CanFrame, DiagChannel, DiagDevice, DiagInterface, FrameChannel, FrameQueue};
use crate::config::{DiagConfig, RetryPolicy};
use crate::error::{DiagnosticError, ErrorHandler, ErrorKind, ErrorSeverity};

mod lib_funcs;

pub use lib_funcs::DrvVersion;
use lib_funcs::PassthruDrv;

/// Poll timeout of the background drain task
const DRAIN_POLL_MS: u32 = 50;
/// Max messages pulled from the adapter per drain poll
const DRAIN_BATCH: u32 = 10;
/// How long a background task gets to wind down before being detached
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Maps a raw PassThru status onto the error taxonomy, with an operator
/// hint matched to the failure
pub(crate) fn map_status(function: &str, err: PassthruError) -> DiagnosticError {
    let base = format!("{function} failed: {err}");
    match err {
        PassthruError::ERR_DEVICE_NOT_CONNECTED => DiagnosticError::new(
            ErrorKind::Hardware,
            ErrorSeverity::Critical,
            base,
        )
        .with_hint("Reseat the USB adapter and check its power LED"),
        PassthruError::ERR_TIMEOUT => DiagnosticError::timeout(base)
            .with_hint("Increase the timeout or check the bus wiring"),
        PassthruError::ERR_INVALID_CHANNEL_ID | PassthruError::ERR_INVALID_DEVICE_ID => {
            DiagnosticError::configuration(base).with_hint("Reopen the device and reconnect")
        }
        _ => DiagnosticError::hardware(base),
    }
    .with_context(function.to_string())
}

/// Extracts (CAN ID, payload) pairs from raw PassThru messages.
///
/// Messages flagged as TX echoes or ISO15765 first-frame indications are
/// skipped: several adapters emit these as zero-padded pseudo frames that
/// would otherwise corrupt reassembly.
fn decode_messages(msgs: &[PASSTHRU_MSG]) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::with_capacity(msgs.len());
    for msg in msgs {
        if msg.rx_status & RxFlag::ISO15765_FIRST_FRAME.bits() != 0
            || msg.rx_status & RxFlag::TX_MSG_TYPE.bits() != 0
        {
            continue;
        }
        let size = msg.data_size as usize;
        if size < 4 || size > msg.data.len() {
            continue;
        }
        let can_id = u32::from_be_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
        out.push((can_id, msg.data[4..size].to_vec()));
    }
    out
}

/// An unopened PassThru adapter interface: the vendor library to load.
/// This is what the session facade is constructed over for real hardware.
#[derive(Debug, Clone)]
pub struct PassthruInterface {
    library_path: String,
}

impl PassthruInterface {
    /// Interface backed by the vendor library at `library_path`
    pub fn new(library_path: impl Into<String>) -> Self {
        Self {
            library_path: library_path.into(),
        }
    }
}

impl DiagInterface for PassthruInterface {
    type Device = PassthruDevice;

    fn open_device(&self, handler: &ErrorHandler, retry: RetryPolicy) -> DiagResult<PassthruDevice> {
        PassthruDevice::open(&self.library_path, handler, retry)
    }
}

/// An opened PassThru device. Closing happens on drop at the latest.
#[derive(Debug)]
pub struct PassthruDevice {
    drv: PassthruDrv,
    device_id: Option<u32>,
}

impl PassthruDevice {
    /// Loads the vendor library at `library_path` and opens the device,
    /// retrying transient hardware failures per `retry`
    pub fn open(
        library_path: &str,
        handler: &ErrorHandler,
        retry: RetryPolicy,
    ) -> DiagResult<Self> {
        let drv = PassthruDrv::load_lib(library_path).map_err(|e| {
            DiagnosticError::new(
                ErrorKind::Configuration,
                ErrorSeverity::Fatal,
                format!("failed to load PassThru library {library_path}: {e}"),
            )
            .with_hint("Check the adapter driver installation and the configured library path")
        })?;

        let open_drv = drv.clone();
        let device_id = handler.retry_with_recovery(
            "PassThruOpen",
            retry,
            || open_drv.open().map_err(|e| map_status("PassThruOpen", e)),
            None,
        )?;
        log::info!("device opened, ID {device_id}");
        if let Ok(version) = drv.read_version(device_id) {
            log::info!(
                "adapter API {}, DLL {}, firmware {}",
                version.api_version,
                version.dll_version,
                version.fw_version
            );
        }
        Ok(Self {
            drv,
            device_id: Some(device_id),
        })
    }

    /// Closes the device. Harmless to call twice.
    pub fn close(&mut self) {
        if let Some(device_id) = self.device_id.take() {
            if let Err(e) = self.drv.close(device_id) {
                log::warn!("PassThruClose failed: {e}");
            } else {
                log::info!("device closed");
            }
        }
    }

    fn require_open(&self) -> DiagResult<u32> {
        self.device_id
            .ok_or_else(|| DiagnosticError::configuration("PassThru device is not open"))
    }
}

impl DiagDevice for PassthruDevice {
    type Channel = PassthruChannel;

    /// Connects an ISO15765 channel at the configured bitrate
    fn connect_channel(&self, cfg: &DiagConfig) -> DiagResult<Arc<PassthruChannel>> {
        let device_id = self.require_open()?;
        let mut flags = ConnectFlags::empty();
        if cfg.can_use_ext_addr {
            flags |= ConnectFlags::CAN_29BIT_ID;
        }
        let channel_id = self
            .drv
            .connect(device_id, Protocol::ISO15765, flags.bits(), cfg.can_bitrate)
            .map_err(|e| map_status("PassThruConnect", e))?;
        log::info!(
            "channel connected, ID {channel_id}, bitrate {} bit/s",
            cfg.can_bitrate
        );
        Ok(Arc::new(PassthruChannel {
            drv: self.drv.clone(),
            channel_id,
            write_timeout_ms: cfg.write_timeout_ms,
            filter_id: Mutex::new(None),
            queue: Arc::new(FrameQueue::new()),
            write_lock: Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            drain: Mutex::new(None),
            open: AtomicBool::new(true),
        }))
    }

    /// Minimal liveness probe: reads the battery voltage on OBD pin 16
    /// through the READ_VBATT ioctl
    #[allow(trivial_casts)]
    fn health_check(&self) -> DiagResult<f32> {
        let device_id = self.require_open()?;
        let mut millivolts: u32 = 0;
        self.drv
            .ioctl(
                device_id,
                IoctlID::READ_VBATT,
                std::ptr::null_mut(),
                (&mut millivolts) as *mut _ as *mut c_void,
            )
            .map_err(|e| map_status("PassThruIoctl(READ_VBATT)", e))?;
        let volts = millivolts as f32 / 1000.0;
        log::info!("adapter reports battery voltage {volts:.2} V");
        Ok(volts)
    }
}

impl Drop for PassthruDevice {
    fn drop(&mut self) {
        log::debug!("Drop called for PassthruDevice");
        self.close();
    }
}

/// A connected ISO15765 channel
///
/// Owns the installed flow-control filter and the background drain task.
/// All writes are serialized through an internal mutex: the keep-alive task
/// and caller requests must never interleave on the adapter write path.
#[derive(Debug)]
pub struct PassthruChannel {
    drv: PassthruDrv,
    channel_id: u32,
    write_timeout_ms: u32,
    filter_id: Mutex<Option<u32>>,
    queue: Arc<FrameQueue>,
    write_lock: Mutex<()>,
    stop: Arc<AtomicBool>,
    drain: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
}

impl PassthruChannel {
    /// Installs the ISO-TP flow-control filter triple for the given ID pair:
    /// mask 0xFFFFFFFF, pattern = response ID, flow control = request ID.
    ///
    /// Any previously installed filter is stopped first. Leaving a stale
    /// filter behind while probing candidate ID pairs confuses some
    /// adapters.
    pub fn set_flow_control_filter(&self, request_id: u32, response_id: u32) -> DiagResult<u32> {
        let mut guard = self.filter_id.lock().unwrap();
        if let Some(old) = guard.take() {
            if let Err(e) = self.drv.stop_msg_filter(self.channel_id, old) {
                log::warn!("PassThruStopMsgFilter failed for filter {old}: {e}");
            }
        }

        let mut mask = PASSTHRU_MSG {
            protocol_id: Protocol::ISO15765 as u32,
            data_size: 4,
            ..Default::default()
        };
        let mut pattern = PASSTHRU_MSG {
            protocol_id: Protocol::ISO15765 as u32,
            data_size: 4,
            ..Default::default()
        };
        let mut flow_control = PASSTHRU_MSG {
            protocol_id: Protocol::ISO15765 as u32,
            data_size: 4,
            ..Default::default()
        };
        mask.data[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        pattern.data[0..4].copy_from_slice(&response_id.to_be_bytes());
        flow_control.data[0..4].copy_from_slice(&request_id.to_be_bytes());

        let filter_id = self
            .drv
            .start_msg_filter(
                self.channel_id,
                FilterType::FLOW_CONTROL_FILTER,
                &mask,
                &pattern,
                Some(flow_control),
            )
            .map_err(|e| map_status("PassThruStartMsgFilter", e))?;
        *guard = Some(filter_id);
        log::info!(
            "flow control filter {filter_id} installed, request 0x{request_id:03X}, response 0x{response_id:03X}"
        );
        Ok(filter_id)
    }

    /// Transmits one CAN frame payload (up to 8 bytes) on the given ID with
    /// the default write timeout
    pub fn write_message(&self, can_id: u32, payload: &[u8]) -> DiagResult<()> {
        let mut msg = PASSTHRU_MSG {
            protocol_id: Protocol::ISO15765 as u32,
            data_size: (4 + payload.len().min(8)) as u32,
            ..Default::default()
        };
        if can_id > 0x7FF {
            msg.tx_flags = TxFlag::CAN_29BIT_ID.bits();
        }
        msg.data[0..4].copy_from_slice(&can_id.to_be_bytes());
        let len = payload.len().min(8);
        msg.data[4..4 + len].copy_from_slice(&payload[..len]);

        let _guard = self.write_lock.lock().unwrap();
        self.drv
            .write_messages(self.channel_id, &mut [msg], self.write_timeout_ms)
            .map_err(|e| map_status("PassThruWriteMsgs", e))?;
        log::debug!("sent ID=0x{can_id:03X}, data={:02X?}", &payload[..len]);
        Ok(())
    }

    /// Reads up to `max` pending (CAN ID, payload) pairs. An empty adapter
    /// buffer yields an empty list, not an error.
    pub fn read_messages(&self, max: u32, timeout_ms: u32) -> DiagResult<Vec<(u32, Vec<u8>)>> {
        let msgs = self
            .drv
            .read_messages(self.channel_id, max, timeout_ms)
            .map_err(|e| map_status("PassThruReadMsgs", e))?;
        Ok(decode_messages(&msgs))
    }

    /// Clears the adapter TX/RX buffers and the local frame queue.
    /// Failures are logged but never propagate.
    pub fn clear_buffers(&self) {
        for (ioctl, name) in [
            (IoctlID::CLEAR_TX_BUFFER, "CLEAR_TX_BUFFER"),
            (IoctlID::CLEAR_RX_BUFFER, "CLEAR_RX_BUFFER"),
        ] {
            if let Err(e) = self.drv.ioctl(
                self.channel_id,
                ioctl,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ) {
                log::warn!("{name} ioctl failed: {e}");
            }
        }
        self.queue.clear();
        log::debug!("buffers cleared");
    }

    /// Starts the background drain task. It polls the adapter with a short
    /// timeout and appends every received frame to the per-ID queue until
    /// the stop signal is set. A failing poll is logged (rate-limited) and
    /// the loop carries on.
    pub fn start_drain(&self) {
        let mut guard = self.drain.lock().unwrap();
        if guard.is_some() {
            log::warn!("drain task already running");
            return;
        }
        self.stop.store(false, Ordering::Relaxed);
        let drv = self.drv.clone();
        let channel_id = self.channel_id;
        let queue = self.queue.clone();
        let stop = self.stop.clone();
        *guard = Some(std::thread::spawn(move || {
            log::debug!("drain task started");
            let mut last_report: Option<Instant> = None;
            let mut suppressed: u32 = 0;
            while !stop.load(Ordering::Relaxed) {
                match drv.read_messages(channel_id, DRAIN_BATCH, DRAIN_POLL_MS) {
                    Ok(msgs) => {
                        for (can_id, payload) in decode_messages(&msgs) {
                            log::debug!("recv ID=0x{can_id:03X}, data={payload:02X?}");
                            queue.push(can_id, payload);
                        }
                    }
                    Err(e) => {
                        suppressed += 1;
                        let due = last_report
                            .is_none_or(|t| t.elapsed() >= Duration::from_secs(1));
                        if due {
                            log::error!("drain read failed ({suppressed} errors since last report): {e}");
                            last_report = Some(Instant::now());
                            suppressed = 0;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            log::debug!("drain task stopped");
        }));
    }

    /// Signals the drain task to stop and waits for it with a bounded
    /// timeout. A task stuck inside the vendor library is detached rather
    /// than blocking disconnect forever.
    pub fn stop_drain(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.drain.lock().unwrap().take() {
            let deadline = Instant::now() + TASK_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("drain task did not stop within {TASK_JOIN_TIMEOUT:?}, detaching");
            }
        }
    }

    /// Stops the drain task, removes the filter and disconnects the
    /// channel. Every step is best-effort; later steps run even when
    /// earlier ones fail. Harmless to call twice.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::Relaxed) {
            return;
        }
        self.stop_drain();
        if let Some(filter_id) = self.filter_id.lock().unwrap().take() {
            if let Err(e) = self.drv.stop_msg_filter(self.channel_id, filter_id) {
                log::warn!("PassThruStopMsgFilter failed: {e}");
            }
        }
        match self.drv.disconnect(self.channel_id) {
            Ok(()) => log::info!("channel disconnected"),
            Err(e) => log::warn!("PassThruDisconnect failed: {e}"),
        }
    }
}

impl DiagChannel for PassthruChannel {
    fn set_flow_control_filter(&self, request_id: u32, response_id: u32) -> DiagResult<u32> {
        PassthruChannel::set_flow_control_filter(self, request_id, response_id)
    }

    fn clear_buffers(&self) {
        PassthruChannel::clear_buffers(self)
    }

    fn start_drain(&self) {
        PassthruChannel::start_drain(self)
    }

    fn shutdown(&self) {
        PassthruChannel::shutdown(self)
    }
}

impl FrameChannel for PassthruChannel {
    fn send_frame(&self, frame: CanFrame) -> DiagResult<()> {
        self.write_message(frame.get_address(), frame.get_data())
    }

    fn poll_frame(&self, can_id: u32) -> Option<Vec<u8>> {
        self.queue.pop(can_id)
    }

    fn is_closing(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || !self.open.load(Ordering::Relaxed)
    }
}

impl Drop for PassthruChannel {
    fn drop(&mut self) {
        log::debug!("Drop called for PassthruChannel");
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_table() {
        let e = map_status("PassThruOpen", PassthruError::ERR_DEVICE_NOT_CONNECTED);
        assert_eq!(e.kind, ErrorKind::Hardware);
        assert_eq!(e.severity, ErrorSeverity::Critical);
        assert!(e.recovery_hint.as_deref().unwrap().contains("Reseat"));

        let e = map_status("PassThruReadMsgs", PassthruError::ERR_TIMEOUT);
        assert_eq!(e.kind, ErrorKind::Timeout);
        assert_eq!(e.severity, ErrorSeverity::Recoverable);

        let e = map_status("PassThruWriteMsgs", PassthruError::ERR_INVALID_CHANNEL_ID);
        assert_eq!(e.kind, ErrorKind::Configuration);
        assert_eq!(e.severity, ErrorSeverity::Critical);

        let e = map_status("PassThruConnect", PassthruError::ERR_FAILED);
        assert_eq!(e.kind, ErrorKind::Hardware);
        assert_eq!(e.severity, ErrorSeverity::Recoverable);
        assert_eq!(e.context.as_deref(), Some("PassThruConnect"));
    }

    fn raw_msg(id: u32, payload: &[u8], rx_status: u32) -> PASSTHRU_MSG {
        let mut msg = PASSTHRU_MSG {
            protocol_id: Protocol::ISO15765 as u32,
            data_size: (4 + payload.len()) as u32,
            rx_status,
            ..Default::default()
        };
        msg.data[0..4].copy_from_slice(&id.to_be_bytes());
        msg.data[4..4 + payload.len()].copy_from_slice(payload);
        msg
    }

    #[test]
    fn decode_splits_id_prefix_from_payload() {
        let msgs = [raw_msg(0x7E8, &[0x02, 0x50, 0x03, 0, 0, 0, 0, 0], 0)];
        let decoded = decode_messages(&msgs);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, 0x7E8);
        assert_eq!(decoded[0].1, vec![0x02, 0x50, 0x03, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn decode_skips_echo_and_indication_messages() {
        let msgs = [
            raw_msg(0x7E8, &[], RxFlag::ISO15765_FIRST_FRAME.bits()),
            raw_msg(0x7E0, &[0x02, 0x3E, 0x80], RxFlag::TX_MSG_TYPE.bits()),
            raw_msg(0x7E8, &[0x01, 0x7E], 0),
        ];
        let decoded = decode_messages(&msgs);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].1, vec![0x01, 0x7E]);
    }
}
