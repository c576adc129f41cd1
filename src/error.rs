//! Errors raised while provisioning a device.
//!
//! Every stage of the provisioning state machine reports failures as a
//! [`ProvisionError`]. The state machine never lets an error escape the
//! physical loop: it wraps it in a [`StageError`] that remembers where it
//! happened, and the [`Severity`] of that pair decides how much of the run
//! is abandoned.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

// =============================================================================
// Public Interface
// =============================================================================

/// All the ways a provisioning run can go wrong.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No board answered on any port, or the requested port never appeared.
    #[error("no device found{}", port_suffix(.0))]
    DeviceNotFound(Option<String>),

    /// The serial monitor connection failed or was disconnected.
    #[error("serial transport error: {0}")]
    TransportError(String),

    /// The captured frame is not valid JSON (or not a JSON object).
    #[error("malformed report: {0}")]
    MalformedReport(String),

    /// One or more required checks are missing or falsy. This is a normal
    /// outcome of the validation stage, kept here so it can be reported like
    /// any other stage result.
    #[error("validation failed for: {}", .0.join(", "))]
    ValidationFailed(Vec<String>),

    /// The ciphertext is empty or not a multiple of the AES block size.
    #[error("invalid ciphertext size ({0} bytes), must be a positive multiple of 16")]
    InvalidCiphertextSize(u64),

    /// The cipher could not be set up or the ciphertext could not be
    /// processed.
    #[error("decryption failure: {0}")]
    DecryptionFailure(String),

    /// The decrypted image does not carry the expected header magic byte.
    #[error("invalid image magic at offset {offset:#x}: expected {expected:#04x}, found {found}")]
    InvalidImageMagic {
        offset: u64,
        expected: u8,
        found: MagicByte,
    },

    /// A required firmware file does not exist.
    #[error("firmware file not found: {}", .0.display())]
    FirmwareNotFound(PathBuf),

    /// The external flashing tool failed.
    #[error("flash tool {operation} failed{}: {message}", baud_suffix(.baud))]
    FlashToolError {
        operation: FlashOperation,
        baud: Option<u32>,
        message: String,
    },

    /// The backend did not accept the report.
    #[error("report submission failed: {0}")]
    SubmissionError(String),

    /// The label printer collaborator failed.
    #[error("label printing failed: {0}")]
    LabelPrintError(String),

    /// Local file system error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// The flashing tool operation that failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashOperation {
    Detect,
    Erase,
    Write,
    Reset,
}
impl fmt::Display for FlashOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashOperation::Detect => "detect",
            FlashOperation::Erase => "erase",
            FlashOperation::Write => "write",
            FlashOperation::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// The byte found where the image magic was expected, if any.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MagicByte {
    Found(u8),
    /// The image is shorter than the magic offset.
    Missing,
}
impl fmt::Display for MagicByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagicByte::Found(b) => write!(f, "{:#04x}", b),
            MagicByte::Missing => f.write_str("end of file"),
        }
    }
}

/// The stages of one provisioning run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Stage {
    WaitForDevice,
    Erase,
    FlashFactory,
    ResetDevice,
    CaptureReport,
    Validate,
    Submit,
    Label,
    Decide,
    DecryptFinal,
    FlashFinal,
    ResetFinal,
    Idle,
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How much of the run a caught error abandons.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    /// The remaining stages of the run are skipped; the station goes idle.
    FatalToRun,
    /// Logged and the run continues.
    Recoverable,
    /// Only the final-image commit is abandoned. The factory image already on
    /// the device is left as is.
    CommitAborted,
}

/// An error caught by the state machine, tagged with the stage it happened
/// in.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub error: ProvisionError,
}
impl StageError {
    pub fn new(stage: Stage, error: ProvisionError) -> Self {
        StageError { stage, error }
    }

    pub fn severity(&self) -> Severity {
        match self.stage {
            Stage::WaitForDevice
            | Stage::Erase
            | Stage::FlashFactory
            | Stage::CaptureReport => Severity::FatalToRun,
            Stage::Validate | Stage::DecryptFinal | Stage::FlashFinal => Severity::CommitAborted,
            Stage::ResetDevice
            | Stage::Submit
            | Stage::Label
            | Stage::Decide
            | Stage::ResetFinal
            | Stage::Idle => Severity::Recoverable,
        }
    }
}
impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.error)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn port_suffix(port: &Option<String>) -> String {
    match port {
        Some(p) => format!(" on {}", p),
        None => String::new(),
    }
}

fn baud_suffix(baud: &Option<u32>) -> String {
    match baud {
        Some(b) => format!(" at {} baud", b),
        None => String::new(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn factory_stage_errors_are_fatal() {
    for stage in &[Stage::Erase, Stage::FlashFactory, Stage::CaptureReport] {
        let err = StageError::new(*stage, ProvisionError::TransportError("gone".into()));
        assert_eq!(err.severity(), Severity::FatalToRun);
    }
}

#[test]
fn submission_and_label_errors_are_recoverable() {
    let submit = StageError::new(Stage::Submit, ProvisionError::SubmissionError("503".into()));
    let label = StageError::new(Stage::Label, ProvisionError::LabelPrintError("jam".into()));
    assert_eq!(submit.severity(), Severity::Recoverable);
    assert_eq!(label.severity(), Severity::Recoverable);
}

#[test]
fn final_commit_errors_only_abort_the_commit() {
    let err = StageError::new(Stage::DecryptFinal, ProvisionError::InvalidCiphertextSize(15));
    assert_eq!(err.severity(), Severity::CommitAborted);
}

#[test]
fn flash_tool_error_message_names_the_baud() {
    let err = ProvisionError::FlashToolError {
        operation: FlashOperation::Write,
        baud: Some(460_800),
        message: "exit status: 2".into(),
    };
    assert_eq!(
        err.to_string(),
        "flash tool write failed at 460800 baud: exit status: 2"
    );
}

#[test]
fn stage_error_display_names_the_stage() {
    let err = StageError::new(Stage::CaptureReport, ProvisionError::TransportError("eof".into()));
    assert_eq!(err.to_string(), "[CaptureReport] serial transport error: eof");
}
