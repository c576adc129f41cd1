//! States for the `provcom` station state machine.
//!
//! This modules is private and restricted to the
//! [`station`](crate::station) scope. The public interface of the state
//! machine is provided by [`station`](crate::station).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use console::style;
use log::{debug, info, warn};

use super::{events::*, state_machine::Tally};
use crate::{
    collaborators::Collaborators,
    error::{ProvisionError, Stage, StageError},
    image::remove_stale_plaintext,
    provision,
    run::ProvisioningRun,
    settings::Settings,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state can do any work that needs to be done and
    /// when finished, requests transition to a new state by returning the
    /// appropriate `event`. The `event` is then consumed to create the new
    /// `state` using the corresponding `From` trait implementation.
    fn run(&mut self, tally: &Tally, settings: &Settings, collab: &mut Collaborators) -> Event;
}

// Init State ==================================================================

/// Represents the initial state of the station state machine. A plaintext
/// image left over by an interrupted session is removed here.
///
///  * **`WaitForDeviceEvent` => `WaitForDeviceState`** always.
#[derive(Debug)]
pub(crate) struct InitState {}
impl Runnable for InitState {
    fn run(&mut self, _tally: &Tally, settings: &Settings, _collab: &mut Collaborators) -> Event {
        info!("=> Init");
        debug!("{:#?}", settings);
        let plaintext = settings.final_image.decrypted_path();
        if let Err(e) = remove_stale_plaintext(&plaintext) {
            warn!("Could not remove {}: {}", plaintext.display(), e);
        }
        Event::WaitForDevice(WaitForDeviceEvent {})
    }
}

// WaitForDevice State =========================================================

/// Find the board to provision.
///
/// When a port is configured, wait for it to appear. When none is, or when
/// the operator cancels the wait, try every serial port with the flashing
/// tool and take the first one a chip answers on.
///
///  * **`DeviceReadyEvent` => `ProvisionState`** when a board is found,
///  * **`NoDeviceEvent` => `NoDeviceState`** otherwise.
#[derive(Debug)]
pub(crate) struct WaitForDeviceState {}
impl Runnable for WaitForDeviceState {
    fn run(&mut self, _tally: &Tally, settings: &Settings, collab: &mut Collaborators) -> Event {
        info!("=> WaitForDevice");

        if let Some(path) = &settings.path {
            if collab.ports.wait_for(path) {
                return Event::DeviceReady(DeviceReadyEvent { port: path.clone() });
            }
            info!("Wait for {} cancelled, scanning all ports", path);
        }

        println!("[PV] 🔍 Scanning serial ports for a device...");
        for port in collab.ports.candidates() {
            match collab.flash_tool.detect(&port) {
                Ok(()) => {
                    println!("[PV] 👍 Device found on {}", style(&port).green());
                    return Event::DeviceReady(DeviceReadyEvent { port });
                }
                Err(e) => debug!("no device on {}: {}", port, e),
            }
        }
        Event::NoDevice(NoDeviceEvent {
            error: ProvisionError::DeviceNotFound(settings.path.clone()),
        })
    }
}

// NoDevice State ==============================================================

/// Tell the operator no board was found and ask whether to look again.
///
///  * **`WaitForDeviceEvent` => `WaitForDeviceState`** to look again,
///  * **`DoneEvent` => `DoneState`** when the operator gives up.
#[derive(Debug)]
pub(crate) struct NoDeviceState {
    pub error: Option<ProvisionError>,
}
impl Runnable for NoDeviceState {
    fn run(&mut self, _tally: &Tally, _settings: &Settings, collab: &mut Collaborators) -> Event {
        info!("=> NoDevice");
        if let Some(error) = self.error.take() {
            let e = StageError::new(Stage::WaitForDevice, error);
            log::error!("{}", e);
            println!("[PV] {} {}", style("✗").red(), e);
        }
        if collab.operator.retry_detection() {
            Event::WaitForDevice(WaitForDeviceEvent {})
        } else {
            Event::Done(DoneEvent { with_errors: true })
        }
    }
}

// Provision State =============================================================

/// Run the provisioning state machine against the board found.
///
///  * **`ProvisionedEvent` => `IdleState`** always: no error ends the
///    station.
#[derive(Debug)]
pub(crate) struct ProvisionState {
    pub port: String,
}
impl Runnable for ProvisionState {
    fn run(&mut self, tally: &Tally, settings: &Settings, collab: &mut Collaborators) -> Event {
        info!("=> Provision");
        println!(
            "[PV] {} device #{} on {}",
            style("▶").cyan(),
            tally.devices() + 1,
            style(&self.port).cyan()
        );
        let run = provision::provision(&self.port, settings, collab);
        Event::Provisioned(ProvisionedEvent { run })
    }
}

// Idle State ==================================================================

/// End of a run: show everything that happened and wait for the operator to
/// swap the board. The run is discarded when leaving the state.
///
///  * **`WaitForDeviceEvent` => `WaitForDeviceState`** when the operator
///    confirms,
///  * **`DoneEvent` => `DoneState`** when the operator stops.
#[derive(Debug)]
pub(crate) struct IdleState {
    /// Consumed when the state runs.
    pub run: Option<ProvisioningRun>,
}
impl Runnable for IdleState {
    fn run(&mut self, tally: &Tally, _settings: &Settings, collab: &mut Collaborators) -> Event {
        info!("=> Idle");
        let mut run = match self.run.take() {
            Some(run) => run,
            None => return Event::WaitForDevice(WaitForDeviceEvent {}),
        };
        run.enter(Stage::Idle);
        run.print_summary();
        println!("[PV] {}", style(tally).dim());

        if collab.operator.next_device(&run) {
            Event::WaitForDevice(WaitForDeviceEvent {})
        } else {
            Event::Done(DoneEvent { with_errors: false })
        }
    }
}

// Done State ==================================================================

#[derive(Debug, Copy, Clone)]
pub(crate) struct DoneState {
    pub with_error: bool,
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn run(&mut self, tally: &Tally, _settings: &Settings, _collab: &mut Collaborators) -> Event {
        info!(
            "=> Done with{}errors",
            if self.with_error { " " } else { " no " }
        );
        println!("[PV] 🏁 {}", tally);
        Event::Exit(ExitEvent {
            with_error: self.with_error,
        })
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<WaitForDeviceEvent> for WaitForDeviceState {
    fn from(_: WaitForDeviceEvent) -> Self {
        WaitForDeviceState {}
    }
}

impl From<DeviceReadyEvent> for ProvisionState {
    fn from(event: DeviceReadyEvent) -> Self {
        ProvisionState { port: event.port }
    }
}

impl From<NoDeviceEvent> for NoDeviceState {
    fn from(event: NoDeviceEvent) -> Self {
        NoDeviceState {
            error: Some(event.error),
        }
    }
}

impl From<ProvisionedEvent> for IdleState {
    fn from(event: ProvisionedEvent) -> Self {
        IdleState {
            run: Some(event.run),
        }
    }
}

impl From<DoneEvent> for DoneState {
    fn from(event: DoneEvent) -> Self {
        DoneState {
            with_error: event.with_errors,
            should_exit: false,
        }
    }
}
impl From<ExitEvent> for DoneState {
    fn from(event: ExitEvent) -> Self {
        DoneState {
            with_error: event.with_error,
            should_exit: true,
        }
    }
}
