//! `provcom` provisioning station: the loop over the devices of a batch.
//!
//! **Example** - Executing the state machine event loop:
//! ```no_run
//! use provcom::{self as pv, DeviceManager};
//!
//! let settings = pv::SettingsBuilder::default().finalize();
//! let collaborators = pv::Collaborators {
//!     ports: Box::new(pv::SystemPorts),
//!     flash_tool: Box::new(pv::EspTool::new(&settings.flash.tool)),
//!     monitor: Box::new(pv::SerialMonitor),
//!     backend: Box::new(pv::HttpBackend::new(settings.api.clone()).unwrap()),
//!     printer: Box::new(pv::ConsoleLabelPrinter),
//!     operator: Box::new(pv::ConsoleOperator),
//! };
//! let mut station = pv::Station::new(settings, collaborators);
//! let status = station.run(); // status code returned after the `Exit` event
//! println!("status: {}", status);
//! std::process::exit(status.into());
//! ```

mod events;
mod state_machine;
mod states;

pub use state_machine::{DeviceManager, Station, Tally};
