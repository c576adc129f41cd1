//! Device detection and the loop over the devices of a batch.
//!
//! The station provisions one device after the other. Boards are plugged in
//! and out by the operator, so the station has to find each new board, and
//! it never moves on to the next board by itself: the operator re-arms it
//! once the current board has been taken care of.
//!
//! The following state diagram summarizes the different states and transitions
//! the station goes through:
//!
//! ```text
//!                    START
//!                      |
//!                      v
//!                  .-------.
//!                  | Init  |
//!                  '-------'
//!                      |
//!                      v
//!             .---------------.  not found   .----------.
//!      .----->| WaitForDevice |------------->| NoDevice |
//!      |      '---------------'<-------------'----------'
//!      |              |              retry          |
//!      |            found                        give up
//!      |              v                             |
//!      |    ********************                    |
//!      |    *    Provision     *                    |
//!      |    * Provisioning SM  *                    |
//!      |    ********************                    |
//!      |              |                             |
//!      |              v                             |
//!      |          .-------.                         |
//!      '----------| Idle  |                         |
//!    next device  '-------'                         |
//!                     | stop                        |
//!                     v                             |
//!                 .-------.                         |
//!                 | Done  |<------------------------'
//!                 '-------'
//!                     |
//!                     v
//!                    END
//! ```

use std::fmt;

use super::events::*;
use super::states::*;
use crate::{collaborators::Collaborators, settings::Settings};

// =============================================================================
// Public Interface
// =============================================================================

pub trait DeviceManager {
    fn run(&mut self) -> i8;
}

/// Counts of the devices handled since the station started.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Tally {
    /// Devices that passed and received the final firmware.
    pub committed: usize,
    /// Devices that passed but kept the diagnostic firmware.
    pub uncommitted: usize,
    /// Devices that failed their checks or could not be tested.
    pub rejected: usize,
}
impl Tally {
    pub fn devices(&self) -> usize {
        self.committed + self.uncommitted + self.rejected
    }
}
impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} device(s): {} committed, {} passed without commit, {} rejected",
            self.devices(),
            self.committed,
            self.uncommitted,
            self.rejected
        )
    }
}

/// Encapsulate the state machine creation and event loop to provide a concise
/// and simple public interface to the module users.
pub struct Station {
    settings: Settings,
    collaborators: Collaborators,
    tally: Tally,
}
impl Station {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        Station {
            settings,
            collaborators,
            tally: Tally::default(),
        }
    }

    /// Counts of the devices handled so far.
    pub fn tally(&self) -> Tally {
        self.tally
    }
}
impl DeviceManager for Station {
    /// The station event loop runs until the `Done` state is reached and its
    /// `should_exit` flag is set. At such point, the event loop terminates and
    /// returns an exit code indicating no errors when equal to **`0`**;
    /// otherwise a termination with error.
    ///
    /// The returned status code could be used as an exit code from `provcom`.
    fn run(&mut self) -> i8 {
        let mut sm = StationStates::Init(StationSM::new(self.tally));
        loop {
            sm = sm.step(&self.settings, &mut self.collaborators);
            if let StationStates::Done(done) = &sm {
                if done.state.should_exit {
                    self.tally = done.tally;
                    return if done.state.with_error { 1 } else { 0 };
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// The state machine implementing the station loop.
///
/// The generic type holds the current state, and the tally is the data shared
/// by all states.
#[derive(Debug)]
struct StationSM<S: Runnable> {
    tally: Tally,
    state: S,
}
impl<S: Runnable> StationSM<S> {
    fn run(&mut self, settings: &Settings, collab: &mut Collaborators) -> Event {
        self.state.run(&self.tally, settings, collab)
    }

    fn transition<T: Runnable>(self, state: T) -> StationSM<T> {
        StationSM {
            tally: self.tally,
            state,
        }
    }
}

/// The station state machine starts in the `InitState`.
impl StationSM<InitState> {
    fn new(tally: Tally) -> Self {
        StationSM {
            tally,
            state: InitState {},
        }
    }
}

/// Wraps the state machine and its various states into a simple enum, which can
/// also be used for pattern matching during state transitions.
enum StationStates {
    Init(StationSM<InitState>),
    WaitForDevice(StationSM<WaitForDeviceState>),
    NoDevice(StationSM<NoDeviceState>),
    Provision(StationSM<ProvisionState>),
    Idle(StationSM<IdleState>),
    Done(StationSM<DoneState>),
}
impl StationStates {
    fn step(self, settings: &Settings, collab: &mut Collaborators) -> Self {
        match self {
            StationStates::Init(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::WaitForDevice(ev) => StationStates::WaitForDevice(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            StationStates::WaitForDevice(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::DeviceReady(ev) => StationStates::Provision(sm.transition(ev.into())),
                    Event::NoDevice(ev) => StationStates::NoDevice(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            StationStates::NoDevice(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::WaitForDevice(ev) => StationStates::WaitForDevice(sm.transition(ev.into())),
                    Event::Done(ev) => StationStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            StationStates::Provision(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Provisioned(ev) => {
                        let run = &ev.run;
                        match (run.is_pass(), run.committed()) {
                            (true, true) => sm.tally.committed += 1,
                            (true, false) => sm.tally.uncommitted += 1,
                            (false, _) => sm.tally.rejected += 1,
                        }
                        StationStates::Idle(sm.transition(ev.into()))
                    }
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            StationStates::Idle(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::WaitForDevice(ev) => StationStates::WaitForDevice(sm.transition(ev.into())),
                    Event::Done(ev) => StationStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            StationStates::Done(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Exit(ev) => StationStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}
