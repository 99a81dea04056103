//! ReadDataByIdentifier (service 0x22)
//!
//! The response must echo the requested DID; payload bytes after the echo
//! are returned raw. Interpreting them (mileage heuristics, ASCII decode)
//! is the caller's business.

use crate::DiagResult;
use crate::error::{DiagnosticError, ErrorKind};

use super::{UdsClient, UdsCommand};

impl UdsClient {
    /// Reads the data block behind a 16-bit identifier, with one
    /// transparent retry on transient errors
    pub fn read_data_by_identifier(&mut self, did: u16) -> DiagResult<Vec<u8>> {
        let timeout_ms = self.options().did_timeout_ms;
        self.read_data_by_identifier_with(did, timeout_ms, 1)
    }

    /// As [Self::read_data_by_identifier], with the response timeout and the
    /// transient retry budget chosen by the caller.
    ///
    /// Only Protocol and Timeout failures are retried. Negative responses
    /// are not: the ECU rejected the request and will reject it again.
    /// Data errors (echo mismatch, short response) are not either.
    pub fn read_data_by_identifier_with(
        &mut self,
        did: u16,
        timeout_ms: u32,
        retries: u32,
    ) -> DiagResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.try_read_did(did, timeout_ms) {
                Ok(data) => return Ok(data),
                Err(e)
                    if attempt < retries
                        && e.nrc.is_none()
                        && matches!(e.kind, ErrorKind::Protocol | ErrorKind::Timeout) =>
                {
                    attempt += 1;
                    log::warn!("DID 0x{did:04X} read failed ({e}), retry {attempt}/{retries}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_read_did(&mut self, did: u16, timeout_ms: u32) -> DiagResult<Vec<u8>> {
        log::debug!("reading DID 0x{did:04X}");
        let response = self.request(UdsCommand::ReadDataByIdentifier, &did.to_be_bytes(), timeout_ms)?;
        if response.len() < 2 {
            let e = DiagnosticError::data(format!(
                "DID 0x{did:04X} response too short ({} bytes)",
                response.len()
            ));
            self.handler().report(&e);
            return Err(e);
        }
        let echoed = u16::from_be_bytes([response[0], response[1]]);
        if echoed != did {
            let e = DiagnosticError::data(format!(
                "DID mismatch: requested 0x{did:04X}, response echoed 0x{echoed:04X}"
            ));
            self.handler().report(&e);
            return Err(e);
        }
        log::debug!(
            "DID 0x{did:04X}: {:02X?} ({} bytes)",
            &response[2..],
            response.len() - 2
        );
        Ok(response[2..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::channel::FrameChannel;
    use crate::error::{ErrorHandler, ErrorKind};
    use crate::isotp::{IsotpLink, IsotpSettings};
    use crate::simulation::SimulationFrameChannel;
    use crate::uds::{UdsClient, UdsOptions};

    const REQ: u32 = 0x7E0;
    const RESP: u32 = 0x7E8;

    fn client(sim: &Arc<SimulationFrameChannel>) -> UdsClient {
        let channel: Arc<dyn FrameChannel> = sim.clone();
        let link = IsotpLink::new(
            channel,
            REQ,
            RESP,
            IsotpSettings {
                timeout_ms: 50,
                ..Default::default()
            },
        );
        UdsClient::new(
            link,
            UdsOptions {
                read_timeout_ms: 50,
                did_timeout_ms: 50,
                tester_present_timeout_ms: 50,
            },
            Arc::new(ErrorHandler::new()),
        )
    }

    fn request_frames(sim: &SimulationFrameChannel) -> usize {
        sim.sent_frames()
            .iter()
            .filter(|f| f.get_data()[0] >> 4 == 0x0)
            .count()
    }

    #[test]
    fn returns_payload_after_did_echo() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x22, 0xF1, 0x92], &[0x62, 0xF1, 0x92, 0x01, 0x02]);
        let mut uds = client(&sim);
        assert_eq!(uds.read_data_by_identifier(0xF192).unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn did_echo_mismatch_is_a_data_error_without_retry() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x22, 0xF1, 0x90], &[0x62, 0xF1, 0x91, 0x01]);
        let mut uds = client(&sim);
        let err = uds.read_data_by_identifier(0xF190).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Data);
        assert_eq!(request_frames(&sim), 1);
    }

    #[test]
    fn timeouts_consume_the_retry_budget() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        // nothing scripted: every request times out
        let mut uds = client(&sim);
        let err = uds.read_data_by_identifier_with(0xF190, 50, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(request_frames(&sim), 2);
    }

    #[test]
    fn negative_responses_are_never_retried() {
        let sim = Arc::new(SimulationFrameChannel::new(REQ, RESP));
        sim.add_response(&[0x22, 0xF1, 0x90], &[0x7F, 0x22, 0x31]);
        let mut uds = client(&sim);
        let err = uds.read_data_by_identifier_with(0xF190, 50, 3).unwrap_err();
        assert_eq!(err.nrc, Some(0x31));
        assert_eq!(request_frames(&sim), 1);
    }
}
