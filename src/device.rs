//! Finding the board on the system and opening its monitor port.

use log::debug;

use crate::{
    capture::ByteSource,
    error::{ProvisionError, Result},
    settings::MonitorSettings,
    utils,
};

// =============================================================================
// Public Interface
// =============================================================================

/// Knows which serial ports exist on the system.
pub trait PortLocator {
    /// Block until `path` exists. Returns `false` when the operator gave up
    /// waiting.
    fn wait_for(&mut self, path: &str) -> bool;
    /// Ports worth scanning for a board, most likely first.
    fn candidates(&mut self) -> Vec<String>;
}

/// Opens the serial line the diagnostic firmware reports on.
pub trait MonitorConnector {
    /// The returned source owns the port; dropping it closes the port.
    fn open(&mut self, path: &str, settings: &MonitorSettings) -> Result<Box<dyn ByteSource>>;
}

/// The serial ports of the host, with an interactive wait.
#[derive(Debug, Default)]
pub struct SystemPorts;
impl PortLocator for SystemPorts {
    fn wait_for(&mut self, path: &str) -> bool {
        utils::wait_for_port(path)
    }

    fn candidates(&mut self) -> Vec<String> {
        let ports = utils::enumerate_serial_ports();
        debug!("candidate ports: {:?}", ports);
        ports
    }
}

/// Opens real serial ports.
#[derive(Debug, Default)]
pub struct SerialMonitor;
impl MonitorConnector for SerialMonitor {
    fn open(&mut self, path: &str, settings: &MonitorSettings) -> Result<Box<dyn ByteSource>> {
        let port = utils::open_and_setup_port(path, settings)
            .map_err(|e| ProvisionError::TransportError(format!("{}: {}", path, e)))?;
        Ok(Box::new(port))
    }
}
