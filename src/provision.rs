//! Provisioning of one device, from erase to final firmware commit.
//!
//! **Example** - Provisioning the board on a known port:
//! ```ignore
//! use provcom::provision;
//!
//! let run = provision::provision("/dev/ttyUSB0", &settings, &mut collaborators);
//! run.print_summary();
//! ```

mod events;
mod state_machine;
mod states;

pub use state_machine::provision;
