//! Events for the `provcom` station state machine.
//!
//! This modules is private and restricted to the
//! [`station`](crate::station) scope. The public interface of the state
//! machine is provided by [`station`](crate::station).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use crate::{error::ProvisionError, run::ProvisioningRun};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// WaitForDeviceEvent ==========================================================

/// Event fired to trigger a transition to the `WaitForDevice` state.
///
/// This event can happen under one of the following circumstances:
///
///  1. While at the `Init` state, when the station starts.
///  2. While at the `NoDevice` state, when the operator asks to look again.
///  3. While at the `Idle` state, when the operator confirms the next device
///     is plugged in.
#[derive(Debug)]
pub(crate) struct WaitForDeviceEvent {}

// DeviceReadyEvent ============================================================

/// Event fired when a board was found, either on the configured port or by
/// scanning all ports. It triggers a transition to the `Provision` state.
#[derive(Debug)]
pub(crate) struct DeviceReadyEvent {
    pub port: String,
}

// NoDeviceEvent ===============================================================

/// Event fired from the `WaitForDevice` state when no board answered. It
/// triggers a transition to the `NoDevice` state.
#[derive(Debug)]
pub(crate) struct NoDeviceEvent {
    pub error: ProvisionError,
}

// ProvisionedEvent ============================================================

/// Event fired when the provisioning of a device is over, whatever its
/// outcome. It triggers a transition to the `Idle` state.
#[derive(Debug)]
pub(crate) struct ProvisionedEvent {
    pub run: ProvisioningRun,
}

// DoneEvent ===================================================================

/// Event fired when the station is about to stop, either because the
/// operator declined to continue or because no device could be found. It
/// triggers a transition to the `Done` state.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub with_errors: bool,
}

// ExitEvent ===================================================================

/// The last event that can be triggered in the station and will result in the
/// event loop terminating with an `exit status`, handing back the control to
/// the original caller that started the event loop.
///
/// The returned `status code` can be used as an exit code from the `main`
/// function.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub with_error: bool,
}

// Events enum ==================================================================

/// Events that can be triggered within the station state machine.
///
/// Each possible value holds an `event`, which in turn may hold additional data
/// for the state transition. Such data is passed by the origin state for
/// potential use by the target state.
#[derive(Debug)]
pub(crate) enum Event {
    WaitForDevice(WaitForDeviceEvent),
    DeviceReady(DeviceReadyEvent),
    NoDevice(NoDeviceEvent),
    Provisioned(ProvisionedEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
