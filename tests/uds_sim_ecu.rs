//! Full-stack scenarios against the simulated ECU: UDS over ISO-TP over the
//! frame transport seam, with the literal wire bytes a real ECU would see.

use std::sync::Arc;

use moto_diagnostics::ErrorHandler;
use moto_diagnostics::channel::{CanFrame, FrameChannel};
use moto_diagnostics::config::dids;
use moto_diagnostics::error::ErrorKind;
use moto_diagnostics::isotp::{IsotpLink, IsotpSettings};
use moto_diagnostics::simulation::SimulationFrameChannel;
use moto_diagnostics::uds::{UdsClient, UdsSessionType, UdsOptions};

const REQUEST_ID: u32 = 0x7E0;
const RESPONSE_ID: u32 = 0x7E8;

fn sim_ecu() -> Arc<SimulationFrameChannel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(SimulationFrameChannel::new(REQUEST_ID, RESPONSE_ID))
}

fn uds_client(sim: &Arc<SimulationFrameChannel>) -> UdsClient {
    let transport: Arc<dyn FrameChannel> = sim.clone();
    let link = IsotpLink::new(
        transport,
        REQUEST_ID,
        RESPONSE_ID,
        IsotpSettings {
            timeout_ms: 200,
            ..Default::default()
        },
    );
    UdsClient::new(
        link,
        UdsOptions {
            read_timeout_ms: 200,
            did_timeout_ms: 200,
            tester_present_timeout_ms: 100,
        },
        Arc::new(ErrorHandler::new()),
    )
}

fn frame_bytes(frame: &CanFrame) -> &[u8] {
    frame.get_data()
}

#[test]
fn read_vin_end_to_end() {
    let sim = sim_ecu();
    let vin = b"1HD1KRM17FB612345";
    let mut response = vec![0x62, 0xF1, 0x90];
    response.extend_from_slice(vin);
    sim.add_response(&[0x22, 0xF1, 0x90], &response);

    let mut uds = uds_client(&sim);
    let data = uds.read_data_by_identifier(dids::VIN).unwrap();
    assert_eq!(data.len(), 17);
    assert_eq!(&data, vin);

    // request frame on 0x7E0 must be `02 22 F1 90 00 00 00 00`
    let sent = sim.sent_frames();
    assert_eq!(sent[0].get_address(), REQUEST_ID);
    assert_eq!(
        frame_bytes(&sent[0]),
        &[0x02, 0x22, 0xF1, 0x90, 0x00, 0x00, 0x00, 0x00]
    );
    // the 20 byte response is multi-frame, so we must have sent FC continue
    assert!(
        sent.iter()
            .any(|f| frame_bytes(f) == [0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
    );
}

#[test]
fn enter_extended_session() {
    let sim = sim_ecu();
    sim.add_response(&[0x10, 0x03], &[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);

    let mut uds = uds_client(&sim);
    uds.set_session_mode(UdsSessionType::Extended).unwrap();
    assert_eq!(uds.session_kind(), UdsSessionType::Extended);

    let sent = sim.sent_frames();
    assert_eq!(
        frame_bytes(&sent[0]),
        &[0x02, 0x10, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn suppressed_tester_present_succeeds_without_response() {
    let sim = sim_ecu();
    let mut uds = uds_client(&sim);
    uds.tester_present(true).unwrap();

    let sent = sim.sent_frames();
    assert_eq!(
        frame_bytes(&sent[0]),
        &[0x02, 0x3E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn negative_response_for_unknown_did() {
    let sim = sim_ecu();
    sim.add_response(&[0x22, 0x00, 0x00], &[0x7F, 0x22, 0x31]);

    let mut uds = uds_client(&sim);
    let err = uds.read_data_by_identifier(0x0000).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Protocol);
    assert_eq!(err.nrc, Some(0x31));
    assert!(err.message.contains("Request out of range"));
}

#[test]
fn multi_frame_read_of_twenty_bytes() {
    let sim = sim_ecu();
    // ECU answer: FF `10 14 62 F1 90 AA BB CC`, CF1 `21 DD EE FF 01 02 03 04`,
    // CF2 `22 05 06 07 08 09 0A 0B` after our FC `30 00 00 ...`
    let response = [
        0x62, 0xF1, 0x90, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
        0x07, 0x08, 0x09, 0x0A, 0x0B,
    ];
    sim.add_response(&[0x22, 0xF1, 0x90], &response);

    let mut uds = uds_client(&sim);
    let data = uds.read_data_by_identifier(0xF190).unwrap();
    assert_eq!(data.len(), 17);
    assert_eq!(
        data,
        vec![
            0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
            0x09, 0x0A, 0x0B
        ]
    );
}

#[test]
fn response_pending_then_delayed_positive() {
    let sim = sim_ecu();
    sim.add_response_sequence(
        &[0x22, 0xF1, 0x92],
        &[&[0x7F, 0x22, 0x78], &[0x62, 0xF1, 0x92, 0x42]],
    );

    let mut uds = uds_client(&sim);
    let data = uds.read_data_by_identifier(dids::ECU_SOFTWARE_NUMBER).unwrap();
    assert_eq!(data, vec![0x42]);
}

#[test]
fn multi_frame_request_round_trip() {
    let sim = sim_ecu();
    // a request payload long enough to need FF + CF segmentation
    let mut request = vec![0x2E, 0xF1, 0x99];
    request.extend_from_slice(&[0x55; 12]);
    sim.add_response(&request[..], &[0x6E, 0xF1, 0x99]);

    let transport: Arc<dyn FrameChannel> = sim.clone();
    let link = IsotpLink::new(
        transport,
        REQUEST_ID,
        RESPONSE_ID,
        IsotpSettings {
            timeout_ms: 200,
            ..Default::default()
        },
    );
    link.send(&request).unwrap();
    let response = link.receive(0).unwrap();
    assert_eq!(response, vec![0x6E, 0xF1, 0x99]);

    let sent = sim.sent_frames();
    assert_eq!(frame_bytes(&sent[0])[0], 0x10); // FF
    assert_eq!(frame_bytes(&sent[1])[0], 0x21); // CF #1
    assert_eq!(frame_bytes(&sent[2])[0], 0x22); // CF #2
}
