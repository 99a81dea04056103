//! TesterPresent (service 0x3E)

use crate::DiagResult;
use crate::error::ErrorKind;

use super::{UdsClient, UdsCommand};

/// Sub-function requesting a positive response
const SUB_RESPOND: u8 = 0x00;
/// Sub-function suppressing the positive response
const SUB_SUPPRESS: u8 = 0x80;

impl UdsClient {
    /// Sends TesterPresent to keep the current session alive.
    ///
    /// With `suppress_response` the ECU is told not to answer
    /// (sub-function 0x80), so silence within the timeout window counts
    /// as success. Without it, a positive response is required.
    pub fn tester_present(&mut self, suppress_response: bool) -> DiagResult<()> {
        let sub = if suppress_response {
            SUB_SUPPRESS
        } else {
            SUB_RESPOND
        };
        let timeout_ms = self.options().tester_present_timeout_ms;
        match self.request(UdsCommand::TesterPresent, &[sub], timeout_ms) {
            Ok(_) => Ok(()),
            Err(e) if suppress_response && e.kind == ErrorKind::Timeout => {
                log::debug!("suppressed tester present sent, no response as expected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::channel::FrameChannel;
    use crate::error::ErrorHandler;
    use crate::isotp::{IsotpLink, IsotpSettings};
    use crate::simulation::SimulationFrameChannel;
    use crate::uds::{UdsClient, UdsOptions};

    fn client(sim: &Arc<SimulationFrameChannel>) -> UdsClient {
        let channel: Arc<dyn FrameChannel> = sim.clone();
        let link = IsotpLink::new(
            channel,
            0x7E0,
            0x7E8,
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

    #[test]
    fn suppressed_tester_present_tolerates_silence() {
        let sim = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
        let mut uds = client(&sim);
        uds.tester_present(true).unwrap();
        let sent = sim.sent_frames();
        assert_eq!(
            sent[0].get_data(),
            &[0x02, 0x3E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn unsuppressed_tester_present_needs_an_answer() {
        let sim = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
        sim.add_response(&[0x3E, 0x00], &[0x7E, 0x00]);
        let mut uds = client(&sim);
        uds.tester_present(false).unwrap();

        // no scripted response for the next one: silence is now a failure
        let sim2 = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
        let mut uds2 = client(&sim2);
        assert!(uds2.tester_present(false).is_err());
    }
}
