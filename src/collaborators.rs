//! The hardware, network and human dependencies of the station.

use crate::{
    backend::BackendApi,
    device::{MonitorConnector, PortLocator},
    flasher::FlashTool,
    label::LabelPrinter,
    operator::Operator,
};

/// Everything the state machines talk to outside of the process, injected
/// when the station is built. Tests swap in fakes.
pub struct Collaborators {
    pub ports: Box<dyn PortLocator>,
    pub flash_tool: Box<dyn FlashTool>,
    pub monitor: Box<dyn MonitorConnector>,
    pub backend: Box<dyn BackendApi>,
    pub printer: Box<dyn LabelPrinter>,
    pub operator: Box<dyn Operator>,
}
