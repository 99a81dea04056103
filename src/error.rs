//! Central error taxonomy and recovery machinery
//!
//! Every failure in the stack, from a vendor API status up to a negative
//! UDS response, funnels into [DiagnosticError]: a (kind, severity) tagged
//! value carrying a message, optional structured context and a short
//! recovery hint for the operator. The [ErrorHandler] classifies and logs
//! errors, keeps an in-memory history for the report collaborator and
//! offers a retry-with-backoff combinator used during device open and
//! connection bring-up.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use strum_macros::Display;
use thiserror::Error;

use crate::DiagResult;
use crate::config::RetryPolicy;

/// Broad classification of a diagnostic failure
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Adapter or USB level problem
    Hardware,
    /// The logical connection to the ECU is missing or broken
    Connection,
    /// ISO-TP or UDS protocol violation, including negative responses
    Protocol,
    /// Malformed or mismatching payload data
    Data,
    /// An operation did not complete within its deadline
    Timeout,
    /// Invalid or missing configuration
    Configuration,
    /// Operating system level failure
    System,
    /// Anything that could not be classified
    Unknown,
}

/// How bad a [DiagnosticError] is, ordered from harmless to terminal
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Informational only
    Info,
    /// Something looked odd but the operation carried on
    Warning,
    /// The operation failed but a retry may succeed
    Recoverable,
    /// The operation failed and needs intervention (reseat, reconfigure)
    Critical,
    /// No point continuing at all
    Fatal,
}

/// The error type shared by every layer of the stack
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct DiagnosticError {
    /// Failure classification
    pub kind: ErrorKind,
    /// How bad it is
    pub severity: ErrorSeverity,
    /// Human readable description
    pub message: String,
    /// Optional structured context, e.g. the failing API function
    pub context: Option<String>,
    /// Short hint telling the operator how to recover
    pub recovery_hint: Option<String>,
    /// Negative response code when the error originates from the ECU itself
    pub nrc: Option<u8>,
    /// When the error was raised
    pub timestamp: SystemTime,
}

impl DiagnosticError {
    /// Creates an error with the given classification
    pub fn new(kind: ErrorKind, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            context: None,
            recovery_hint: None,
            nrc: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Recoverable hardware error
    pub fn hardware(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Hardware, ErrorSeverity::Recoverable, message)
    }

    /// Recoverable connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, ErrorSeverity::Recoverable, message)
    }

    /// Recoverable protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, ErrorSeverity::Recoverable, message)
    }

    /// Payload data error (length or identifier mismatch)
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, ErrorSeverity::Recoverable, message)
    }

    /// Recoverable timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, ErrorSeverity::Recoverable, message)
    }

    /// Critical configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, ErrorSeverity::Critical, message)
    }

    /// Attaches structured context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches a recovery hint for the operator
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Marks the error as ECU-originated with the given negative response code
    pub fn with_nrc(mut self, nrc: u8) -> Self {
        self.nrc = Some(nrc);
        self
    }
}

/// One history entry as handed to the report collaborator
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorRecord {
    /// When the error was raised
    pub timestamp: SystemTime,
    /// Failure classification
    pub kind: ErrorKind,
    /// How bad it was
    pub severity: ErrorSeverity,
    /// Human readable description
    pub message: String,
}

impl From<&DiagnosticError> for ErrorRecord {
    fn from(e: &DiagnosticError) -> Self {
        Self {
            timestamp: e.timestamp,
            kind: e.kind,
            severity: e.severity,
            message: e.message.clone(),
        }
    }
}

/// Aggregated view over the error history
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorSummary {
    /// Total number of recorded errors
    pub total_errors: usize,
    /// Number of Critical or Fatal entries
    pub critical_errors: usize,
    /// Error count per kind
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    /// The most recent entries, oldest first
    pub recent_errors: Vec<ErrorRecord>,
}

/// How many entries [ErrorHandler::summary] reports back
const SUMMARY_RECENT_LEN: usize = 10;

/// Central error sink
///
/// The handler is deliberately not a global: the session facade takes an
/// `Arc<ErrorHandler>` so that the calling application can share the same
/// instance with its report generator.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    history: Mutex<Vec<DiagnosticError>>,
    counts: Mutex<HashMap<ErrorKind, u64>>,
}

impl ErrorHandler {
    /// Creates an empty handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error: logs it at a level matching its severity and
    /// appends it to the history
    pub fn report(&self, error: &DiagnosticError) {
        match error.severity {
            ErrorSeverity::Fatal | ErrorSeverity::Critical => {
                log::error!("[{}] {} (critical)", error.kind, error.message)
            }
            ErrorSeverity::Recoverable => log::error!("[{}] {}", error.kind, error.message),
            ErrorSeverity::Warning => log::warn!("[{}] {}", error.kind, error.message),
            ErrorSeverity::Info => log::info!("[{}] {}", error.kind, error.message),
        }
        if let Some(hint) = &error.recovery_hint {
            log::info!("hint: {hint}");
        }
        self.history.lock().unwrap().push(error.clone());
        *self.counts.lock().unwrap().entry(error.kind).or_insert(0) += 1;
    }

    /// Runs `op` up to `policy.max_attempts` times with exponential backoff
    /// between attempts, invoking `recovery` (if any) before each retry.
    ///
    /// Only Recoverable and Critical errors are retried. Fatal errors and
    /// negative responses from the ECU propagate immediately: retrying a
    /// request the ECU actively rejected only spams the bus.
    pub fn retry_with_recovery<T, F>(
        &self,
        label: &str,
        policy: RetryPolicy,
        mut op: F,
        mut recovery: Option<&mut dyn FnMut()>,
    ) -> DiagResult<T>
    where
        F: FnMut() -> DiagResult<T>,
    {
        let mut delay = policy.initial_delay;
        let mut last: Option<DiagnosticError> = None;
        for attempt in 1..=policy.max_attempts {
            log::debug!("{label}: attempt {attempt}/{}", policy.max_attempts);
            match op() {
                Ok(v) => {
                    if attempt > 1 {
                        log::info!("{label} succeeded after {attempt} attempts");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    self.report(&e);
                    if e.severity == ErrorSeverity::Fatal || e.nrc.is_some() {
                        return Err(e);
                    }
                    last = Some(e);
                    if attempt < policy.max_attempts {
                        log::warn!("{label} failed, retrying in {delay:?}");
                        std::thread::sleep(delay);
                        delay = delay.mul_f32(policy.backoff_factor);
                        if let Some(cb) = recovery.as_mut() {
                            log::debug!("{label}: running recovery callback");
                            cb();
                        }
                    }
                }
            }
        }
        // max_attempts >= 1, so `last` is always populated here
        let last = last.unwrap_or_else(|| {
            DiagnosticError::new(ErrorKind::Unknown, ErrorSeverity::Critical, "no attempts made")
        });
        Err(DiagnosticError {
            kind: last.kind,
            severity: ErrorSeverity::Critical,
            message: format!(
                "{label} failed after {} attempts: {}",
                policy.max_attempts, last.message
            ),
            context: last.context,
            recovery_hint: last.recovery_hint,
            nrc: None,
            timestamp: SystemTime::now(),
        })
    }

    /// Aggregated counts plus the last few entries
    pub fn summary(&self) -> ErrorSummary {
        let history = self.history.lock().unwrap();
        let critical = history
            .iter()
            .filter(|e| e.severity >= ErrorSeverity::Critical)
            .count();
        let start = history.len().saturating_sub(SUMMARY_RECENT_LEN);
        ErrorSummary {
            total_errors: history.len(),
            critical_errors: critical,
            errors_by_kind: self.counts.lock().unwrap().clone(),
            recent_errors: history[start..].iter().map(ErrorRecord::from).collect(),
        }
    }

    /// The last `n` recorded errors, oldest first
    pub fn recent(&self, n: usize) -> Vec<DiagnosticError> {
        let history = self.history.lock().unwrap();
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    /// Drops the recorded history and counters
    pub fn clear(&self) {
        self.history.lock().unwrap().clear();
        self.counts.lock().unwrap().clear();
        log::info!("error history cleared");
    }
}
