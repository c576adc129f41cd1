//! Helper functions to deal with serial ports and the operator's terminal.

mod keyboard;
mod ports;

pub(crate) use keyboard::*;
pub(crate) use ports::{enumerate_serial_ports, open_and_setup_port, wait_for_port};
