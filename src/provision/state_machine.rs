//! `provcom` provisioning state machine.
//!
//! One run of this machine provisions one device. It writes the diagnostic
//! firmware, reads the self-test report the board prints on its console,
//! reports the result, and only for a passing board commits the final
//! firmware.
//!
//! The following state diagram summarizes the different states and transitions
//! of a run. Every state can also jump to `Done` when it records an error
//! that ends the run (see [`Severity`](crate::Severity)):
//!
//! ```text
//!     START
//!       |
//!       v
//!   .-------.    .--------------.    .-------------.    .---------------.
//!   | Erase |--->| FlashFactory |--->| ResetDevice |--->| CaptureReport |
//!   '-------'    '--------------'    '-------------'    '---------------'
//!                                                               |
//!        .------------------------------------------------------'
//!        v
//!   .----------.    .-------------.    .--------.  fail
//!   | Validate |--->| SubmitLabel |--->| Decide |-------------------.
//!   '----------'    '-------------'    '--------'                   |
//!                                          | pass                   |
//!                                          v                        |
//!   .------------.    .------------.    .--------------.            |
//!   | ResetFinal |<---| FlashFinal |<---| DecryptFinal |            |
//!   '------------'    '------------'    '--------------'            |
//!         |                                                         v
//!         |                                                     .------.
//!         '---------------------------------------------------->| Done |
//!                                                               '------'
//!                                                                   |
//!                                                                   v
//!                                                                  END
//! ```

use super::events::*;
use super::states::*;
use crate::{collaborators::Collaborators, run::ProvisioningRun, settings::Settings};

// =============================================================================
// Public Interface
// =============================================================================

/// Provision the device on `port` and return the record of the run.
///
/// The event loop runs until the `Done` state is reached and its
/// `should_exit` flag is set. Errors never escape: they are recorded in the
/// returned run.
pub fn provision(
    port: &str,
    settings: &Settings,
    collaborators: &mut Collaborators,
) -> ProvisioningRun {
    // The same machine naturally starts in the `Erase` state.
    let mut sm = ProvisionStates::Erase(ProvisionSM::new(ProvisioningRun::new(port)));
    loop {
        sm = match sm.step(settings, collaborators) {
            ProvisionStates::Done(sm) if sm.state.should_exit => return sm.run,
            next => next,
        };
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine implementing the provisioning of one device.
///
/// The generic type holds the current state, and the run is the data shared
/// by all the states.
#[derive(Debug)]
struct ProvisionSM<S: Runnable> {
    run: ProvisioningRun,
    state: S,
}
impl<S: Runnable> ProvisionSM<S> {
    fn run(&mut self, settings: &Settings, collab: &mut Collaborators) -> Event {
        self.state.run(&mut self.run, settings, collab)
    }

    /// Move the run into a machine holding `state`. This consumes the
    /// current state.
    fn transition<T: Runnable>(self, state: T) -> ProvisionSM<T> {
        ProvisionSM {
            run: self.run,
            state,
        }
    }
}

/// The state machine starts in the `EraseState`.
impl ProvisionSM<EraseState> {
    fn new(run: ProvisioningRun) -> Self {
        ProvisionSM {
            run,
            state: EraseState {},
        }
    }
}

/// An enum wrapper around the states of the provisioning state machine. It
/// provides a simpler and more intuitive model for manipulating states and
/// their transitions.
enum ProvisionStates {
    Erase(ProvisionSM<EraseState>),
    FlashFactory(ProvisionSM<FlashFactoryState>),
    ResetDevice(ProvisionSM<ResetDeviceState>),
    CaptureReport(ProvisionSM<CaptureReportState>),
    Validate(ProvisionSM<ValidateState>),
    SubmitLabel(ProvisionSM<SubmitLabelState>),
    Decide(ProvisionSM<DecideState>),
    DecryptFinal(ProvisionSM<DecryptFinalState>),
    FlashFinal(ProvisionSM<FlashFinalState>),
    ResetFinal(ProvisionSM<ResetFinalState>),
    Done(ProvisionSM<DoneState>),
}
impl ProvisionStates {
    /// The unit of work in the state machine event loop. It runs the current
    /// state and turns the event it returns into the next state. State
    /// transitions from events are implemented using the rust `From`/`Into`
    /// pattern, so an event can only lead to the states it was meant for.
    fn step(self, settings: &Settings, collab: &mut Collaborators) -> Self {
        match self {
            ProvisionStates::Erase(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::FlashFactory(ev) => ProvisionStates::FlashFactory(sm.transition(ev.into())),
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::FlashFactory(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::ResetDevice(ev) => ProvisionStates::ResetDevice(sm.transition(ev.into())),
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::ResetDevice(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::CaptureReport(ev) => {
                        ProvisionStates::CaptureReport(sm.transition(ev.into()))
                    }
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::CaptureReport(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Validate(ev) => ProvisionStates::Validate(sm.transition(ev.into())),
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::Validate(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::SubmitLabel(ev) => ProvisionStates::SubmitLabel(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::SubmitLabel(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Decide(ev) => ProvisionStates::Decide(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::Decide(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::DecryptFinal(ev) => {
                        ProvisionStates::DecryptFinal(sm.transition(ev.into()))
                    }
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::DecryptFinal(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::FlashFinal(ev) => ProvisionStates::FlashFinal(sm.transition(ev.into())),
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::FlashFinal(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::ResetFinal(ev) => ProvisionStates::ResetFinal(sm.transition(ev.into())),
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::ResetFinal(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Done(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::Done(mut sm) => {
                let event = sm.run(settings, collab);
                match event {
                    Event::Exit(ev) => ProvisionStates::Done(sm.transition(ev.into())),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}
