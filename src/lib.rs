//! Provcom provisions ESP32 boards on a production line.
//!
//! For every board plugged into the station, `provcom` erases the chip,
//! flashes a diagnostic firmware, reads the self-test report the firmware
//! prints on its serial console, submits the report to the production
//! backend and prints the device label. Only when every required check
//! passed does it decrypt the production firmware and commit it to the
//! board. Then it waits for the operator to plug the next board.
//!
//! Most of the functionality in `provcom` is implemented as state machines.
//! State machines are implemented in terms of **states** and **transitions**
//! between them with the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * It is possible to have some shared data between **all** states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions should be permitted and as many errors
//!   should be detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state and
//!   renders it unusable.
//! * Data can be transferred from one state to the next by attaching it to the
//!   transition event.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern: each event converts into the state it leads to, and any other
//! transition is a compile-time error.
//!
//! Two machines are nested:
//!
//! * the [station](station) loops over devices, finds each board and waits
//!   for the operator between boards,
//! * the [provisioning](provision) machine takes one board from erase to the
//!   final firmware commit.
//!
//! Everything outside of the process (flashing tool, serial ports, backend,
//! label printer, operator) is reached through the traits grouped in
//! [`Collaborators`], which tests replace with fakes.

pub mod backend;
pub mod capture;
mod collaborators;
pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod label;
pub mod operator;
pub mod provision;
pub mod report;
mod run;
mod settings;
pub mod station;
mod utils;

pub use backend::{BackendApi, HttpBackend, Submission};
pub use capture::{ByteSource, FrameCapture};
pub use collaborators::Collaborators;
pub use device::{MonitorConnector, PortLocator, SerialMonitor, SystemPorts};
pub use error::{ProvisionError, Result, Severity, Stage, StageError};
pub use flasher::{EspTool, FlashController, FlashPlan, FlashTool};
pub use image::{DecryptedImage, EncryptedImage, ImageKey};
pub use label::{CommandLabelPrinter, ConsoleLabelPrinter, LabelJob, LabelPrinter};
pub use operator::{ConsoleOperator, Operator};
pub use report::{CapturedReport, Verdict, REQUIRED_CHECKS};
pub use run::ProvisioningRun;
pub use settings::{
    ApiSettings, FinalImageSettings, FlashSettings, LabelSettings, MonitorSettings, Settings,
    SettingsBuilder,
};
pub use station::{DeviceManager, Station, Tally};
