//! End-to-end connection orchestration
//!
//! [DiagClient] is the surface the calling application talks to. It brings
//! the stack up in order (library, device, channel, filter, drain task,
//! session, keep-alive), verifies the link with a VIN read before declaring
//! success, and tears everything down best-effort in reverse. Disconnect is
//! idempotent and safe from any partial-construction state.
//!
//! The client is generic over [DiagInterface], so the same staged bring-up
//! runs against a real PassThru adapter or against
//! [crate::simulation::SimulationInterface] in tests.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::DiagResult;
use crate::channel::{DiagChannel, DiagDevice, DiagInterface, FrameChannel};
use crate::config::{DiagConfig, dids};
use crate::error::{DiagnosticError, ErrorHandler, ErrorSummary};
use crate::isotp::{IsotpLink, IsotpSettings};
use crate::passthru::PassthruInterface;
use crate::uds::{UdsClient, UdsOptions, UdsSessionType};

/// The channel type an interface's device hands out
type ChannelOf<I> = <<I as DiagInterface>::Device as DiagDevice>::Channel;

/// How long a background task gets to wind down before being detached
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between requests when sweeping many DIDs, so the keep-alive task
/// gets a word in and slow ECUs are not hammered
const SWEEP_PAUSE: Duration = Duration::from_millis(100);

/// Identification DIDs swept by [DiagClient::read_ecu_info]
const IDENT_DIDS: [(u16, &str); 8] = [
    (dids::ECU_SERIAL_NUMBER, "ECU Serial Number"),
    (dids::VIN, "VIN"),
    (dids::ECU_HARDWARE_NUMBER, "Hardware Number"),
    (dids::ECU_SOFTWARE_NUMBER, "Software Number"),
    (dids::SUPPLIER_ID, "Supplier ID"),
    (dids::MANUFACTURE_DATE, "Date of Manufacture"),
    (dids::SYSTEM_NAME, "System Name"),
    (dids::ACTIVE_SESSION, "Active Diagnostic Session"),
];

/// One identification record returned by [DiagClient::read_ecu_info]
#[derive(Debug, Clone)]
pub struct IdentRecord {
    /// The data identifier that was read
    pub did: u16,
    /// Standardized name of the identifier
    pub name: &'static str,
    /// Raw payload bytes; interpretation is the caller's business
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Connected<D: DiagDevice> {
    device: D,
    channel: Arc<D::Channel>,
    uds: Arc<Mutex<UdsClient>>,
    keep_alive: KeepAlive,
}

/// The diagnostic session facade
///
/// The error handler is injected rather than global so the calling
/// application can hand the same instance to its report generator. The
/// adapter interface is injected the same way.
#[derive(Debug)]
pub struct DiagClient<I: DiagInterface> {
    interface: I,
    config: DiagConfig,
    handler: Arc<ErrorHandler>,
    state: Option<Connected<I::Device>>,
    working_ids: Option<(u32, u32)>,
}

impl DiagClient<PassthruInterface> {
    /// Creates a disconnected client driving a PassThru adapter through
    /// the vendor library named in the configuration
    pub fn new(config: DiagConfig, handler: Arc<ErrorHandler>) -> Self {
        let interface = PassthruInterface::new(config.library_path.clone());
        Self::with_interface(interface, config, handler)
    }
}

impl<I: DiagInterface> DiagClient<I> {
    /// Creates a disconnected client over an arbitrary adapter interface
    pub fn with_interface(interface: I, config: DiagConfig, handler: Arc<ErrorHandler>) -> Self {
        Self {
            interface,
            config,
            handler,
            state: None,
            working_ids: None,
        }
    }

    /// Whether a verified connection is up
    pub fn is_connected(&self) -> bool {
        self.state.is_some()
    }

    /// The (request, response) CAN ID pair the current or last connection
    /// ended up using
    pub fn working_ids(&self) -> Option<(u32, u32)> {
        self.working_ids
    }

    /// The diagnostic session the ECU is currently in, when connected
    pub fn session_kind(&self) -> Option<UdsSessionType> {
        self.state
            .as_ref()
            .map(|s| s.uds.lock().unwrap().session_kind())
    }

    /// The shared error handler, for the report collaborator
    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    /// Aggregated error history
    pub fn error_summary(&self) -> ErrorSummary {
        self.handler.summary()
    }

    /// The last `n` recorded errors, oldest first
    pub fn recent_errors(&self, n: usize) -> Vec<DiagnosticError> {
        self.handler.recent(n)
    }

    /// Brings the connection up and verifies it with a VIN read.
    ///
    /// With `auto_detect` the configured candidate list of CAN ID pairs is
    /// probed in order until one of them answers a VIN request; otherwise
    /// the configured pair is used directly. A failed verify tears the
    /// attempt down and retries the whole sequence with exponential
    /// backoff, per the configured retry policy.
    pub fn connect(&mut self, auto_detect: bool) -> DiagResult<()> {
        if self.state.is_some() {
            log::warn!("connect called while already connected");
            return Ok(());
        }
        let handler = self.handler.clone();
        let policy = self.config.retry;
        handler.retry_with_recovery("connect", policy, || self.try_connect(auto_detect), None)
    }

    fn try_connect(&mut self, auto_detect: bool) -> DiagResult<()> {
        log::info!("opening the diagnostic adapter");
        let device = self.interface.open_device(&self.handler, self.config.retry)?;
        let channel = device.connect_channel(&self.config)?;
        device.health_check()?;
        channel.start_drain();

        let (request_id, response_id) = if auto_detect {
            self.probe_can_ids(&channel)
        } else {
            (self.config.request_id, self.config.response_id)
        };
        channel.set_flow_control_filter(request_id, response_id)?;
        // let the adapter settle, then flush whatever accumulated
        std::thread::sleep(Duration::from_millis(200));
        channel.clear_buffers();

        let mut uds = self.make_uds(&channel, request_id, response_id);
        if let Err(e) = uds.set_session_mode(UdsSessionType::Extended) {
            log::warn!("extended session rejected ({e}), continuing in the default session");
        }
        let uds = Arc::new(Mutex::new(uds));
        let keep_alive = KeepAlive::start(uds.clone(), self.config.tester_present_interval);

        // end-to-end verification: a VIN read must yield 17 bytes
        let verify = uds
            .lock()
            .unwrap()
            .read_data_by_identifier_with(dids::VIN, self.config.verify_timeout_ms, 1);
        match verify {
            Ok(vin) if vin.len() == 17 => {
                log::info!(
                    "connected, CAN IDs request=0x{request_id:03X} response=0x{response_id:03X}"
                );
                self.working_ids = Some((request_id, response_id));
                self.state = Some(Connected {
                    device,
                    channel,
                    uds,
                    keep_alive,
                });
                Ok(())
            }
            other => {
                keep_alive.stop();
                channel.shutdown();
                match other {
                    Ok(vin) => Err(DiagnosticError::data(format!(
                        "connection verify failed: VIN length {} != 17",
                        vin.len()
                    ))
                    .with_hint("Check the CAN ID pair and the bus wiring")),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Tries every candidate (request, response) pair with a VIN read.
    /// Falls back to the configured pair when nothing answers.
    fn probe_can_ids(&self, channel: &Arc<ChannelOf<I>>) -> (u32, u32) {
        log::info!(
            "probing {} candidate CAN ID pairs",
            self.config.candidate_ids.len()
        );
        for &(request_id, response_id) in &self.config.candidate_ids {
            log::info!("trying request=0x{request_id:03X}, response=0x{response_id:03X}");
            if let Err(e) = channel.set_flow_control_filter(request_id, response_id) {
                log::warn!("filter install failed for candidate pair: {e}");
                continue;
            }
            channel.clear_buffers();
            let mut probe = self.make_uds(channel, request_id, response_id);
            match probe.read_data_by_identifier_with(dids::VIN, self.config.verify_timeout_ms, 0) {
                Ok(vin) if vin.len() == 17 => {
                    log::info!("candidate pair answered with a valid VIN");
                    return (request_id, response_id);
                }
                Ok(vin) => {
                    log::debug!("candidate answered with {} VIN bytes, skipping", vin.len());
                }
                Err(e) => {
                    log::debug!("candidate did not answer: {e}");
                }
            }
        }
        log::warn!("no candidate pair answered, falling back to the configured pair");
        (self.config.request_id, self.config.response_id)
    }

    fn make_uds(
        &self,
        channel: &Arc<ChannelOf<I>>,
        request_id: u32,
        response_id: u32,
    ) -> UdsClient {
        let transport: Arc<dyn FrameChannel> = channel.clone();
        let link = IsotpLink::new(
            transport,
            request_id,
            response_id,
            IsotpSettings {
                block_size: self.config.block_size,
                st_min: self.config.st_min,
                timeout_ms: self.config.frame_timeout_ms,
                sequence_policy: self.config.sequence_policy,
            },
        );
        UdsClient::new(
            link,
            UdsOptions {
                read_timeout_ms: self.config.frame_timeout_ms,
                did_timeout_ms: self.config.read_did_timeout_ms,
                tester_present_timeout_ms: self.config.tester_present_timeout_ms,
            },
            self.handler.clone(),
        )
    }

    /// Tears the connection down: keep-alive first, then the drain task,
    /// channel and device. Every step is best-effort. Idempotent, and safe
    /// after a failed connect.
    pub fn disconnect(&mut self) {
        let Some(state) = self.state.take() else {
            log::debug!("disconnect called while not connected");
            return;
        };
        log::info!("disconnecting");
        state.keep_alive.stop();
        state.channel.shutdown();
        drop(state.uds);
        drop(state.device);
        log::info!("disconnected");
    }

    /// Reads the data block behind a DID. Requires a connection.
    pub fn read_data_by_identifier(&self, did: u16) -> DiagResult<Vec<u8>> {
        let uds = self.uds()?;
        let mut guard = uds.lock().unwrap();
        guard.read_data_by_identifier(did)
    }

    /// Switches the diagnostic session. Requires a connection.
    pub fn diagnostic_session_control(&self, kind: UdsSessionType) -> DiagResult<()> {
        let uds = self.uds()?;
        let mut guard = uds.lock().unwrap();
        guard.set_session_mode(kind)
    }

    /// Sends a TesterPresent outside the keep-alive schedule.
    /// Requires a connection.
    pub fn tester_present(&self, suppress_response: bool) -> DiagResult<()> {
        let uds = self.uds()?;
        let mut guard = uds.lock().unwrap();
        guard.tester_present(suppress_response)
    }

    /// Reads the VIN (DID 0xF190) and decodes it as ASCII.
    ///
    /// A VIN must be exactly 17 characters; I, O and Q are outside the
    /// ISO 3779 alphabet and only warned about, since some ECUs report
    /// placeholder VINs from the factory.
    pub fn read_vin(&self) -> DiagResult<String> {
        let data = self.read_data_by_identifier(dids::VIN)?;
        if data.len() != 17 {
            let e = DiagnosticError::data(format!("VIN length {} != 17", data.len()));
            self.handler.report(&e);
            return Err(e);
        }
        let vin = String::from_utf8_lossy(&data).into_owned();
        if vin.chars().any(|c| matches!(c.to_ascii_uppercase(), 'I' | 'O' | 'Q')) {
            log::warn!("VIN contains characters outside the ISO 3779 alphabet: {vin}");
        }
        log::info!("VIN: {vin}");
        Ok(vin)
    }

    /// Sweeps the standard identification DIDs and returns whatever the
    /// ECU answers. Unsupported identifiers are skipped silently.
    pub fn read_ecu_info(&self) -> DiagResult<Vec<IdentRecord>> {
        let uds = self.uds()?;
        let mut records = Vec::new();
        for (did, name) in IDENT_DIDS {
            let result = uds.lock().unwrap().read_data_by_identifier(did);
            match result {
                Ok(data) => {
                    log::info!("{name}: {data:02X?}");
                    records.push(IdentRecord { did, name, data });
                }
                Err(e) => log::debug!("{name} (0x{did:04X}) unavailable: {e}"),
            }
            std::thread::sleep(SWEEP_PAUSE);
        }
        Ok(records)
    }

    /// Reads every DID in `range` in order and returns the readable ones
    /// with their raw payloads. Used to hunt for undocumented identifiers
    /// such as odometer candidates; interpreting the bytes is external.
    pub fn scan_data_identifiers(
        &self,
        range: RangeInclusive<u16>,
    ) -> DiagResult<Vec<(u16, Vec<u8>)>> {
        let uds = self.uds()?;
        log::info!(
            "scanning DIDs 0x{:04X}..0x{:04X}",
            range.start(),
            range.end()
        );
        let mut found = Vec::new();
        for did in range {
            let result = uds.lock().unwrap().read_data_by_identifier_with(
                did,
                self.config.read_did_timeout_ms,
                0,
            );
            match result {
                Ok(data) => {
                    log::info!("DID 0x{did:04X}: {data:02X?} ({} bytes)", data.len());
                    found.push((did, data));
                }
                Err(e) => log::debug!("DID 0x{did:04X} unavailable: {e}"),
            }
            std::thread::sleep(SWEEP_PAUSE);
        }
        log::info!("scan finished, {} readable DIDs", found.len());
        Ok(found)
    }

    fn uds(&self) -> DiagResult<Arc<Mutex<UdsClient>>> {
        match &self.state {
            Some(s) => Ok(s.uds.clone()),
            None => {
                let e = DiagnosticError::connection("not connected to the ECU")
                    .with_hint("Call connect() first");
                self.handler.report(&e);
                Err(e)
            }
        }
    }
}

impl<I: DiagInterface> Drop for DiagClient<I> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Background task sending a suppressed TesterPresent on a fixed interval
/// while the session is up. Failures are logged, never fatal.
#[derive(Debug)]
struct KeepAlive {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    fn start(uds: Arc<Mutex<UdsClient>>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_t = stop.clone();
        let handle = std::thread::spawn(move || {
            log::debug!("keep-alive task started, interval {interval:?}");
            loop {
                // sleep in short slices so disconnect stays prompt
                let wake = Instant::now() + interval;
                while Instant::now() < wake {
                    if stop_t.load(Ordering::Relaxed) {
                        log::debug!("keep-alive task stopped");
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                if let Err(e) = uds.lock().unwrap().tester_present(true) {
                    log::warn!("keep-alive tester present failed: {e}");
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + TASK_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("keep-alive task did not stop in time, detaching");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn client() -> DiagClient<PassthruInterface> {
        DiagClient::new(DiagConfig::default(), Arc::new(ErrorHandler::new()))
    }

    #[test]
    fn disconnect_is_idempotent_without_a_connection() {
        let mut c = client();
        assert!(!c.is_connected());
        c.disconnect();
        c.disconnect();
        assert!(!c.is_connected());
        assert_eq!(c.working_ids(), None);
    }

    #[test]
    fn operations_require_a_connection() {
        let c = client();
        let err = c.read_data_by_identifier(dids::VIN).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connection);
        assert!(c.tester_present(true).is_err());
        assert!(c.diagnostic_session_control(UdsSessionType::Extended).is_err());
        assert!(c.read_vin().is_err());
    }

    #[test]
    fn refused_operations_land_in_the_error_history() {
        let c = client();
        let _ = c.read_data_by_identifier(dids::VIN);
        let summary = c.error_summary();
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.errors_by_kind[&ErrorKind::Connection], 1);
        assert_eq!(c.recent_errors(5).len(), 1);
    }

    #[test]
    fn keep_alive_stops_within_the_join_timeout() {
        // no connection needed: the task only touches the UDS mutex when
        // its interval elapses, which this test never reaches
        let sim = Arc::new(crate::simulation::SimulationFrameChannel::new(0x7E0, 0x7E8));
        let transport: Arc<dyn FrameChannel> = sim.clone();
        let link = IsotpLink::new(transport, 0x7E0, 0x7E8, IsotpSettings::default());
        let uds = Arc::new(Mutex::new(UdsClient::new(
            link,
            UdsOptions::default(),
            Arc::new(ErrorHandler::new()),
        )));
        let ka = KeepAlive::start(uds, Duration::from_secs(60));
        let started = Instant::now();
        ka.stop();
        assert!(started.elapsed() < TASK_JOIN_TIMEOUT);
    }
}
