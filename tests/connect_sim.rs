//! Facade-level bring-up scenarios against the simulated adapter: the full
//! connect/verify/disconnect sequence, candidate CAN ID auto-probe, the
//! extended-session fallback and the verify rollback path.

use std::sync::Arc;
use std::time::Duration;

use moto_diagnostics::ErrorHandler;
use moto_diagnostics::config::{DiagConfig, RetryPolicy};
use moto_diagnostics::error::ErrorKind;
use moto_diagnostics::session::DiagClient;
use moto_diagnostics::simulation::{SimulationFrameChannel, SimulationInterface};
use moto_diagnostics::uds::UdsSessionType;

const VIN_REQUEST: [u8; 3] = [0x22, 0xF1, 0x90];
const VIN: &[u8; 17] = b"1HD1KRM17FB612345";

fn vin_response() -> Vec<u8> {
    let mut response = vec![0x62, 0xF1, 0x90];
    response.extend_from_slice(VIN);
    response
}

fn extended_session_ok(sim: &SimulationFrameChannel) {
    sim.add_response(&[0x10, 0x03], &[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
}

fn fast_config() -> DiagConfig {
    DiagConfig {
        frame_timeout_ms: 100,
        read_did_timeout_ms: 100,
        tester_present_timeout_ms: 50,
        verify_timeout_ms: 100,
        retry: RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
        },
        ..Default::default()
    }
}

fn facade(
    sim: &Arc<SimulationFrameChannel>,
    config: DiagConfig,
) -> DiagClient<SimulationInterface> {
    let _ = env_logger::builder().is_test(true).try_init();
    DiagClient::with_interface(
        SimulationInterface::new(sim.clone()),
        config,
        Arc::new(ErrorHandler::new()),
    )
}

#[test]
fn connect_with_configured_ids_enters_extended_session() {
    let sim = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
    extended_session_ok(&sim);
    sim.add_response(&VIN_REQUEST, &vin_response());

    let mut client = facade(&sim, fast_config());
    client.connect(false).unwrap();
    assert!(client.is_connected());
    assert_eq!(client.working_ids(), Some((0x7E0, 0x7E8)));
    assert_eq!(client.session_kind(), Some(UdsSessionType::Extended));
    assert_eq!(client.read_vin().unwrap(), "1HD1KRM17FB612345");

    client.disconnect();
    assert!(!client.is_connected());
    client.disconnect();
}

#[test]
fn auto_probe_finds_the_second_candidate_pair() {
    // ECU listening on the functional address: candidate (0x7E0, 0x7E8)
    // times out, (0x7DF, 0x7E8) answers the VIN read
    let sim = Arc::new(SimulationFrameChannel::new(0x7DF, 0x7E8));
    sim.add_response(&VIN_REQUEST, &vin_response());

    let mut client = facade(&sim, fast_config());
    client.connect(true).unwrap();
    assert!(client.is_connected());
    assert_eq!(client.working_ids(), Some((0x7DF, 0x7E8)));

    // the failed candidate's filter was replaced, never left installed
    let filters = sim.installed_filters();
    assert_eq!(filters[0], (0x7E0, 0x7E8));
    assert_eq!(filters[1], (0x7DF, 0x7E8));
    assert_eq!(*filters.last().unwrap(), (0x7DF, 0x7E8));
}

#[test]
fn extended_session_rejection_degrades_to_default() {
    let sim = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
    // the ECU refuses the session switch but still answers reads
    sim.add_response(&[0x10, 0x03], &[0x7F, 0x10, 0x11]);
    sim.add_response(&VIN_REQUEST, &vin_response());

    let mut client = facade(&sim, fast_config());
    client.connect(false).unwrap();
    assert!(client.is_connected());
    assert_eq!(client.session_kind(), Some(UdsSessionType::Default));
}

#[test]
fn failed_verify_rolls_back_and_retries_with_backoff() {
    // nothing scripted: every VIN verify times out and each attempt is
    // torn down before the next
    let sim = Arc::new(SimulationFrameChannel::new(0x7E0, 0x7E8));
    let config = DiagConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        },
        ..fast_config()
    };
    let mut client = facade(&sim, config);

    let err = client.connect(false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(!client.is_connected());
    // two bring-up attempts, each verifying with one transparent retry
    let vin_requests = sim
        .sent_frames()
        .iter()
        .filter(|f| f.get_data()[..4] == [0x03, 0x22, 0xF1, 0x90])
        .count();
    assert_eq!(vin_requests, 4);

    // the rollback left the stack reusable: scripting the ECU makes the
    // same client connect fine
    sim.add_response(&VIN_REQUEST, &vin_response());
    client.connect(false).unwrap();
    assert!(client.is_connected());
}
