//! DiagnosticSessionControl (service 0x10)

use crate::DiagResult;

use super::{UdsClient, UdsCommand};

/// UDS diagnostic session modes handled by SID 0x10
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UdsSessionType {
    /// Default session, active after ECU power-on. Needs no keep-alive
    Default,
    /// Programming session, enables flashing related services
    Programming,
    /// Extended session, enables the full identification read-out
    Extended,
    /// Safety system session
    SafetySystem,
    /// Manufacturer or supplier specific session (0x40..0x7E)
    Other(u8),
}

impl From<UdsSessionType> for u8 {
    fn from(kind: UdsSessionType) -> u8 {
        match kind {
            UdsSessionType::Default => 0x01,
            UdsSessionType::Programming => 0x02,
            UdsSessionType::Extended => 0x03,
            UdsSessionType::SafetySystem => 0x04,
            UdsSessionType::Other(x) => x,
        }
    }
}

impl UdsClient {
    /// Switches the ECU into the given diagnostic session. On a positive
    /// response the client records the new session kind; the payload also
    /// carries the server's P2/P2* timings, which we log and otherwise
    /// leave alone.
    pub fn set_session_mode(&mut self, kind: UdsSessionType) -> DiagResult<()> {
        let sub: u8 = kind.into();
        log::info!("requesting diagnostic session 0x{sub:02X}");
        let timeout_ms = self.options().read_timeout_ms;
        let response = self.request(UdsCommand::DiagnosticSessionControl, &[sub], timeout_ms)?;
        if response.len() >= 5 {
            let p2 = u16::from_be_bytes([response[1], response[2]]);
            let p2_star = u16::from_be_bytes([response[3], response[4]]);
            log::debug!("session timings: P2={p2} ms, P2*={p2_star} x10 ms");
        }
        self.set_session_kind(kind);
        log::info!("diagnostic session 0x{sub:02X} active");
        Ok(())
    }
}
