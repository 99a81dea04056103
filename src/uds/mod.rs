//! UDS (ISO14229) request/response engine
//!
//! Builds `[SID, params..]` requests, pushes them through the ISO-TP link
//! and classifies what comes back: a positive response (`SID + 0x40`), a
//! negative response (`7F SID NRC`) or something unexpected. NRC 0x78
//! ("response pending") keeps the client waiting for the real answer.
//!
//! Services are implemented in their own files, one module per service:
//! * [diagnostic_session_control] - service 0x10
//! * [read_data_by_identifier] - service 0x22
//! * [tester_present] - service 0x3E

use std::sync::Arc;

use crate::DiagResult;
use crate::error::{DiagnosticError, ErrorHandler, ErrorSeverity};
use crate::isotp::IsotpLink;

pub mod diagnostic_session_control;
pub mod read_data_by_identifier;
pub mod tester_present;

pub use diagnostic_session_control::UdsSessionType;

/// A positive response echoes the request SID plus this offset
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// First byte of every negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// The UDS services this client speaks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UdsCommand {
    /// Diagnostic session control. See [diagnostic_session_control]
    DiagnosticSessionControl = 0x10,
    /// Read data by identifier. See [read_data_by_identifier]
    ReadDataByIdentifier = 0x22,
    /// Tester present keep-alive. See [tester_present]
    TesterPresent = 0x3E,
}

/// Negative response codes, byte 2 of a `7F` response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Nrc {
    /// 0x10
    GeneralReject,
    /// 0x11
    ServiceNotSupported,
    /// 0x12
    SubFunctionNotSupported,
    /// 0x13
    IncorrectMessageLengthOrInvalidFormat,
    /// 0x14
    ResponseTooLong,
    /// 0x21
    BusyRepeatRequest,
    /// 0x22
    ConditionsNotCorrect,
    /// 0x24
    RequestSequenceError,
    /// 0x31
    RequestOutOfRange,
    /// 0x33
    SecurityAccessDenied,
    /// 0x35
    InvalidKey,
    /// 0x36
    ExceedNumberOfAttempts,
    /// 0x37
    RequiredTimeDelayNotExpired,
    /// 0x78 - the ECU accepted the request but needs more time
    RequestCorrectlyReceivedResponsePending,
    /// 0x7E
    SubFunctionNotSupportedInActiveSession,
    /// 0x7F
    ServiceNotSupportedInActiveSession,
    /// Any other code
    IsoSaeReserved(u8),
}

impl From<u8> for Nrc {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::IsoSaeReserved(other),
        }
    }
}

impl Nrc {
    /// The published ISO 14229 description of the code
    pub fn description(&self) -> String {
        match self {
            Self::GeneralReject => "General reject".into(),
            Self::ServiceNotSupported => "Service not supported".into(),
            Self::SubFunctionNotSupported => "Sub-function not supported".into(),
            Self::IncorrectMessageLengthOrInvalidFormat => {
                "Incorrect message length or invalid format".into()
            }
            Self::ResponseTooLong => "Response too long".into(),
            Self::BusyRepeatRequest => "Busy, repeat request".into(),
            Self::ConditionsNotCorrect => "Conditions not correct".into(),
            Self::RequestSequenceError => "Request sequence error".into(),
            Self::RequestOutOfRange => "Request out of range".into(),
            Self::SecurityAccessDenied => "Security access denied".into(),
            Self::InvalidKey => "Invalid key".into(),
            Self::ExceedNumberOfAttempts => "Exceeded number of attempts".into(),
            Self::RequiredTimeDelayNotExpired => "Required time delay not expired".into(),
            Self::RequestCorrectlyReceivedResponsePending => {
                "Request correctly received but response is pending".into()
            }
            Self::SubFunctionNotSupportedInActiveSession => {
                "Sub-function not supported in active session".into()
            }
            Self::ServiceNotSupportedInActiveSession => {
                "Service not supported in active session".into()
            }
            Self::IsoSaeReserved(code) => format!("Unknown NRC 0x{code:02X}"),
        }
    }
}

impl std::fmt::Display for Nrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Per-service response timeouts
#[derive(Debug, Copy, Clone)]
pub struct UdsOptions {
    /// Generic response wait, used by session control and raw requests
    pub read_timeout_ms: u32,
    /// ReadDataByIdentifier response wait
    pub did_timeout_ms: u32,
    /// TesterPresent response wait
    pub tester_present_timeout_ms: u32,
}

impl Default for UdsOptions {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            did_timeout_ms: 2000,
            tester_present_timeout_ms: 500,
        }
    }
}

/// A UDS client bound to one ISO-TP link
///
/// Strictly synchronous: one outstanding request at a time. The session
/// facade wraps the client in a mutex so the keep-alive task and caller
/// requests serialize on the whole send/receive critical section.
#[derive(Debug)]
pub struct UdsClient {
    link: IsotpLink,
    options: UdsOptions,
    handler: Arc<ErrorHandler>,
    session_kind: UdsSessionType,
}

impl UdsClient {
    /// Creates a client over the given link. The ECU starts out in the
    /// default session.
    pub fn new(link: IsotpLink, options: UdsOptions, handler: Arc<ErrorHandler>) -> Self {
        Self {
            link,
            options,
            handler,
            session_kind: UdsSessionType::Default,
        }
    }

    /// The diagnostic session the ECU was last switched into
    pub fn session_kind(&self) -> UdsSessionType {
        self.session_kind
    }

    /// Sends `[sid, args..]` and classifies the response.
    ///
    /// A positive response is returned without its SID echo byte. A
    /// response with an unexpected SID is logged and returned raw; the
    /// caller decides what to make of it.
    pub fn request(&mut self, sid: UdsCommand, args: &[u8], timeout_ms: u32) -> DiagResult<Vec<u8>> {
        let mut request = Vec::with_capacity(args.len() + 1);
        request.push(sid as u8);
        request.extend_from_slice(args);
        log::debug!("UDS request: {request:02X?}");

        if let Err(e) = self.link.send(&request) {
            self.handler.report(&e);
            return Err(e);
        }
        self.await_response(sid as u8, timeout_ms)
    }

    fn await_response(&mut self, sid: u8, timeout_ms: u32) -> DiagResult<Vec<u8>> {
        loop {
            let response = match self.link.receive(timeout_ms) {
                Ok(r) => r,
                Err(e) => {
                    let e = e.with_context(format!("sid=0x{sid:02X}"));
                    self.handler.report(&e);
                    return Err(e);
                }
            };
            if response.is_empty() {
                let e = DiagnosticError::protocol("empty UDS response")
                    .with_context(format!("sid=0x{sid:02X}"));
                self.handler.report(&e);
                return Err(e);
            }
            log::debug!("UDS response: {response:02X?}");

            if response[0] == NEGATIVE_RESPONSE_SID {
                if response.len() < 3 {
                    let e = DiagnosticError::protocol("malformed negative response")
                        .with_context(format!("sid=0x{sid:02X}"));
                    self.handler.report(&e);
                    return Err(e);
                }
                let code = response[2];
                let nrc = Nrc::from(code);
                if nrc == Nrc::RequestCorrectlyReceivedResponsePending {
                    // the ECU is working on it, keep listening
                    log::warn!("response pending for SID 0x{sid:02X}, re-awaiting");
                    let mut pending = DiagnosticError::protocol(format!(
                        "negative response: {nrc} (NRC 0x{code:02X})"
                    ))
                    .with_nrc(code);
                    pending.severity = ErrorSeverity::Warning;
                    self.handler.report(&pending);
                    continue;
                }
                let e = DiagnosticError::protocol(format!(
                    "negative response: {nrc} (NRC 0x{code:02X})"
                ))
                .with_nrc(code)
                .with_context(format!("sid=0x{sid:02X}"));
                self.handler.report(&e);
                return Err(e);
            }

            if response[0] == sid.wrapping_add(POSITIVE_RESPONSE_OFFSET) {
                log::debug!("positive response for SID 0x{sid:02X}");
                return Ok(response[1..].to_vec());
            }

            log::warn!(
                "unexpected response SID 0x{:02X} for request 0x{sid:02X}",
                response[0]
            );
            return Ok(response);
        }
    }

    pub(crate) fn options(&self) -> UdsOptions {
        self.options
    }

    pub(crate) fn set_session_kind(&mut self, kind: UdsSessionType) {
        self.session_kind = kind;
    }

    pub(crate) fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameChannel;
    use crate::error::ErrorKind;
    use crate::isotp::IsotpSettings;
    use crate::simulation::SimulationFrameChannel;

    const REQ: u32 = 0x7E0;
    const RESP: u32 = 0x7E8;

    fn client(sim: &Arc<SimulationFrameChannel>) -> UdsClient {
        let channel: Arc<dyn FrameChannel> = sim.clone();
        let link = IsotpLink::new(
            channel,
            REQ,
            RESP,
            IsotpSettings {
                timeout_ms: 100,
                ..Default::default()
            },
        );
        UdsClient::new(
            link,
            UdsOptions {
                read_timeout_ms: 100,
                did_timeout_ms: 100,
                tester_present_timeout_ms: 50,
            },
            Arc::new(ErrorHandler::new()),
        )
    }

    #[test]
    fn positive_response_strips_sid_echo() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x10, 0x03], &[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        let mut uds = client(&sim);
        let payload = uds
            .request(UdsCommand::DiagnosticSessionControl, &[0x03], 100)
            .unwrap();
        assert_eq!(payload, vec![0x03, 0x00, 0x32, 0x01, 0xF4]);
    }

    #[test]
    fn negative_response_carries_nrc_and_description() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x22, 0x00, 0x00], &[0x7F, 0x22, 0x31]);
        let mut uds = client(&sim);
        let err = uds.read_data_by_identifier(0x0000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert_eq!(err.nrc, Some(0x31));
        assert!(err.message.contains("Request out of range"));
    }

    #[test]
    fn response_pending_waits_for_the_real_answer() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response_sequence(
            &[0x22, 0xF1, 0x86],
            &[&[0x7F, 0x22, 0x78], &[0x62, 0xF1, 0x86, 0x03]],
        );
        let mut uds = client(&sim);
        let data = uds.read_data_by_identifier(0xF186).unwrap();
        assert_eq!(data, vec![0x03]);
    }

    #[test]
    fn unexpected_sid_returns_raw_response() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x3E, 0x00], &[0x51, 0x00]);
        let mut uds = client(&sim);
        let raw = uds.request(UdsCommand::TesterPresent, &[0x00], 100).unwrap();
        assert_eq!(raw, vec![0x51, 0x00]);
    }

    #[test]
    fn nrc_descriptions_match_iso14229() {
        assert_eq!(Nrc::from(0x11).description(), "Service not supported");
        assert_eq!(Nrc::from(0x31).description(), "Request out of range");
        assert_eq!(
            Nrc::from(0x78).description(),
            "Request correctly received but response is pending"
        );
        assert_eq!(Nrc::from(0x99).description(), "Unknown NRC 0x99");
    }

    #[test]
    fn errors_accumulate_in_the_handler_history() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x22, 0x00, 0x00], &[0x7F, 0x22, 0x31]);
        let mut uds = client(&sim);
        let _ = uds.read_data_by_identifier(0x0000);
        let summary = uds.handler().summary();
        assert_eq!(summary.errors_by_kind[&ErrorKind::Protocol], 1);
    }
}
