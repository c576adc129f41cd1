//! Events for the `provcom` provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope. The public interface of the state
//! machine is provided by [`provision`](crate::provision).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.
//!
//! Events only carry what a state hands over to the next one. The
//! [`ProvisioningRun`](crate::ProvisioningRun) itself is shared by all the
//! states of the machine.

use crate::image::DecryptedImage;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// FlashFactoryEvent ===========================================================

/// Fired by the `Erase` state once the chip is blank.
#[derive(Debug)]
pub(crate) struct FlashFactoryEvent {}

// ResetDeviceEvent ============================================================

/// Fired by the `FlashFactory` state once the diagnostic firmware is written.
#[derive(Debug)]
pub(crate) struct ResetDeviceEvent {}

// CaptureReportEvent ==========================================================

/// Fired by the `ResetDevice` state, whether or not the reset succeeded: the
/// flashing tool usually resets the board on its own.
#[derive(Debug)]
pub(crate) struct CaptureReportEvent {}

// ValidateEvent ===============================================================

/// Fired by the `CaptureReport` state once a well formed report is stored in
/// the run.
#[derive(Debug)]
pub(crate) struct ValidateEvent {}

// SubmitLabelEvent ============================================================

/// Fired by the `Validate` state, whatever the verdict.
#[derive(Debug)]
pub(crate) struct SubmitLabelEvent {}

// DecideEvent =================================================================

/// Fired by the `SubmitLabel` state, whatever the outcome of the submission
/// and of the printing.
#[derive(Debug)]
pub(crate) struct DecideEvent {}

// DecryptFinalEvent ===========================================================

/// Fired by the `Decide` state, only for a passing verdict.
#[derive(Debug)]
pub(crate) struct DecryptFinalEvent {}

// FlashFinalEvent =============================================================

/// Fired by the `DecryptFinal` state with the validated plaintext image.
#[derive(Debug)]
pub(crate) struct FlashFinalEvent {
    /// Moved to the next state, which removes the file once flashed.
    pub image: DecryptedImage,
}

// ResetFinalEvent =============================================================

/// Fired by the `FlashFinal` state once the final firmware is committed.
#[derive(Debug)]
pub(crate) struct ResetFinalEvent {}

// DoneEvent ===================================================================

/// Event fired when the run completes, normally or after a fatal error, and
/// triggers a transition to the `Done` state.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    /// When `true`, at least one error was caught during the run.
    pub with_errors: bool,
}

// ExitEvent ===================================================================

/// The last event of the provisioning state machine. The event loop stops
/// and hands the run back to the station.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub with_error: bool,
}

// Events enum ==================================================================

/// Events that can be triggered within the provisioning state machine.
///
/// Each possible value holds an `event`, which in turn may hold additional data
/// for the state transition.
#[derive(Debug)]
pub(crate) enum Event {
    FlashFactory(FlashFactoryEvent),
    ResetDevice(ResetDeviceEvent),
    CaptureReport(CaptureReportEvent),
    Validate(ValidateEvent),
    SubmitLabel(SubmitLabelEvent),
    Decide(DecideEvent),
    DecryptFinal(DecryptFinalEvent),
    FlashFinal(FlashFinalEvent),
    ResetFinal(ResetFinalEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
