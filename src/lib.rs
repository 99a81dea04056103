#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A host-side diagnostic client for motorcycle ECUs, speaking
//! UDS (ISO14229) over ISO-TP (ISO15765-2) over CAN (ISO11898) through a
//! PassThru-compatible USB adapter (SAE J2534).
//!
//! The crate covers the full protocol stack plus the concurrency and
//! error-recovery machinery around it:
//!
//! * [passthru] - a typed binding to the vendor PassThru function library.
//!   Opens the device, establishes a CAN channel, installs the ISO-TP
//!   flow-control filter and pumps received frames into a per-ID queue from
//!   a background drain task.
//! * [isotp] - an ISO15765-2 segmentation engine fragmenting and
//!   reassembling payloads of up to 4095 bytes across Single, First,
//!   Consecutive and Flow Control frames.
//! * [uds] - request/response handling for the diagnostic services used by
//!   a read-only workstation client: DiagnosticSessionControl,
//!   TesterPresent and ReadDataByIdentifier.
//! * [session] - the connection facade. Brings the whole stack up
//!   (optionally probing a candidate list of CAN ID pairs), verifies the
//!   link with a VIN read, keeps the session alive in the background, and
//!   tears everything down again in any order of partial failure.
//! * [error] - the error taxonomy shared by all layers, plus the central
//!   [error::ErrorHandler] which records history for report generation and
//!   provides retry-with-backoff.
//!
//! What this crate deliberately does **not** contain: the command line front
//! end, configuration file loading, report formatting, interpretation of DID
//! payloads (mileage heuristics and friends) and the platform-specific
//! search for the vendor library. Those live in the calling application;
//! the [config::DiagConfig] struct is the hand-over point.

pub mod channel;
pub mod config;
pub mod error;
pub mod isotp;
pub mod passthru;
pub mod session;
pub mod simulation;
pub mod uds;

pub use error::{DiagnosticError, ErrorHandler, ErrorKind, ErrorSeverity};
pub use session::DiagClient;

/// Result type returned by every fallible operation in this crate
pub type DiagResult<T> = Result<T, DiagnosticError>;
