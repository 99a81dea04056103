//! Configuration surface of the diagnostic core
//!
//! All values in here are produced by the calling application (config file,
//! CLI flags, auto-detection) and consumed by the [crate::session::DiagClient]
//! facade. The core never reads configuration from disk itself.

use std::time::Duration;

/// Ordered candidate list of (request, response) CAN ID pairs tried during
/// auto-detection. The physical 0x7E0/0x7E8 pair is by far the most common,
/// followed by the OBD2 functional address and the 29-bit extended pair seen
/// on some model years.
pub const CAN_ID_CANDIDATES: [(u32, u32); 5] = [
    (0x7E0, 0x7E8),
    (0x7DF, 0x7E8),
    (0x18DA10F1, 0x18DAF110),
    (0x7E1, 0x7E9),
    (0x7E2, 0x7EA),
];

/// Well-known UDS data identifiers for ECU identification
pub mod dids {
    /// Vehicle identification number (17 ASCII characters)
    pub const VIN: u16 = 0xF190;
    /// ECU hardware number
    pub const ECU_HARDWARE_NUMBER: u16 = 0xF191;
    /// ECU software / calibration number
    pub const ECU_SOFTWARE_NUMBER: u16 = 0xF192;
    /// ECU serial number
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    /// System supplier identifier
    pub const SUPPLIER_ID: u16 = 0xF194;
    /// ECU manufacturing date
    pub const MANUFACTURE_DATE: u16 = 0xF195;
    /// System name or engine type
    pub const SYSTEM_NAME: u16 = 0xF197;
    /// Active diagnostic session
    pub const ACTIVE_SESSION: u16 = 0xF19E;
    /// Active diagnostic information
    pub const DIAGNOSTIC_ID: u16 = 0xF186;
}

/// Bounded retry with exponential backoff, used for device open and
/// connection bring-up
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// What to do when a Consecutive Frame arrives with an unexpected sequence
/// number during reassembly
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SequencePolicy {
    /// Log a warning and keep assembling. Matches common tester behaviour
    /// and tolerates ECUs with sloppy sequence counters
    #[default]
    Lenient,
    /// Abort the transfer with a protocol error
    Strict,
}

/// Everything the session facade needs to know, with the documented defaults
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagConfig {
    /// Path to the vendor PassThru library. Resolving this path
    /// (registry scan, candidate directories) is the caller's job
    pub library_path: String,
    /// CAN bitrate in bit/s
    pub can_bitrate: u32,
    /// Open the channel for 29-bit arbitration IDs
    pub can_use_ext_addr: bool,
    /// Request CAN ID (tester to ECU)
    pub request_id: u32,
    /// Response CAN ID (ECU to tester)
    pub response_id: u32,
    /// Candidate (request, response) pairs tried by auto-detection, in order
    pub candidate_ids: Vec<(u32, u32)>,
    /// ISO-TP block size advertised in our Flow Control frames.
    /// 0 means "send everything without further flow control"
    pub block_size: u8,
    /// ISO-TP minimum separation time advertised in our Flow Control frames
    pub st_min: u8,
    /// Consecutive Frame sequence checking during reassembly
    pub sequence_policy: SequencePolicy,
    /// Timeout for a single CAN write through the adapter
    pub write_timeout_ms: u32,
    /// Timeout waiting for an individual ISO-TP frame (Flow Control, next
    /// Consecutive Frame) and the default UDS response wait
    pub frame_timeout_ms: u32,
    /// Response timeout for ReadDataByIdentifier
    pub read_did_timeout_ms: u32,
    /// Response timeout for TesterPresent
    pub tester_present_timeout_ms: u32,
    /// Timeout for the VIN read that verifies a fresh connection
    pub verify_timeout_ms: u32,
    /// Interval between background TesterPresent keep-alives
    pub tester_present_interval: Duration,
    /// Retry policy for device open and connection bring-up
    pub retry: RetryPolicy,
    /// Whether the caller wants a diagnostic report emitted on disconnect.
    /// The core only carries the flag; report generation is external
    pub emit_report: bool,
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            library_path: String::new(),
            can_bitrate: 500_000,
            can_use_ext_addr: false,
            request_id: 0x7E0,
            response_id: 0x7E8,
            candidate_ids: CAN_ID_CANDIDATES.to_vec(),
            block_size: 0,
            st_min: 0,
            sequence_policy: SequencePolicy::default(),
            write_timeout_ms: 100,
            frame_timeout_ms: 1000,
            read_did_timeout_ms: 2000,
            tester_present_timeout_ms: 500,
            verify_timeout_ms: 5000,
            tester_present_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            emit_report: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DiagConfig::default();
        assert_eq!(cfg.can_bitrate, 500_000);
        assert_eq!((cfg.request_id, cfg.response_id), (0x7E0, 0x7E8));
        assert_eq!(cfg.candidate_ids[0], (0x7E0, 0x7E8));
        assert_eq!(cfg.candidate_ids[2], (0x18DA10F1, 0x18DAF110));
        assert_eq!(cfg.write_timeout_ms, 100);
        assert_eq!(cfg.frame_timeout_ms, 1000);
        assert_eq!(cfg.read_did_timeout_ms, 2000);
        assert_eq!(cfg.tester_present_timeout_ms, 500);
        assert_eq!(cfg.verify_timeout_ms, 5000);
        assert_eq!(cfg.tester_present_interval, Duration::from_secs(2));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.sequence_policy, SequencePolicy::Lenient);
    }
}
