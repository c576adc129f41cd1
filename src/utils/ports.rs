//! Locating the board's serial port and opening it.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use retry::{delay, retry_with_index};
use serialport::{available_ports, SerialPort, SerialPortType};

use std::{
    process,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use crate::{
    settings::MonitorSettings,
    utils::{poll_key, Key},
};

//==============================================================================
// Public Interface
//==============================================================================

/// Check for a device with the given path in the system. If not immediately
/// found, enter into a waiting loop, checking every period of time whether the
/// device has been created or not. While waiting, the operator can cancel
/// waiting by pressing the `ESC` key.
///
/// Returns `true` when the port is ready, `false` when the wait was
/// cancelled.
pub(crate) fn wait_for_port(path: &str) -> bool {
    let waiting_period: u64 = 2;

    // Fast path, the board is already plugged in.
    if check_requested_port(&enumerate_serial_ports(), path) {
        info!("Serial port {} is ready", path);
        return true;
    }

    let pb = spinner();
    pb.set_message(format!(
        "⏳ Waiting for {} to be ready (ESC to scan all ports)...",
        style(path).cyan()
    ));

    // The keyboard thread sends on `cancel_tx` when `Esc` is pressed, and
    // stops when it receives on `done_rx`.
    let (cancel_tx, cancel_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let keyboard_thread = thread::spawn(move || loop {
        if done_rx.try_recv().is_ok() {
            break;
        }
        match poll_key(Duration::from_millis(500)) {
            Ok(Some(Key::Escape)) => {
                let _ = cancel_tx.send(());
                break;
            }
            Ok(Some(Key::Interrupt)) => process::exit(0),
            Ok(None) => {}
            Err(e) => {
                // No usable terminal, the wait can only end with the port
                debug!("keyboard polling stopped: {}", e);
                break;
            }
        }
    });

    let mut attempt: u64 = 1;
    let ready = loop {
        let found_ports = enumerate_serial_ports();
        if check_requested_port(&found_ports, path) {
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
            break true;
        }

        let waited = attempt * waiting_period;
        pb.set_message(format!(
            "[{:03}s {}] ⏳ Waiting for {} to be ready (ESC to scan all ports)...",
            style(waited).dim(),
            found_ports.len(),
            style(path).cyan()
        ));

        match cancel_rx.recv_timeout(Duration::from_secs(waiting_period)) {
            Ok(()) => {
                pb.finish_with_message(format!(
                    "❌ Waiting on port {} canceled after {} seconds",
                    style(path).cyan(),
                    style(waited).dim()
                ));
                break false;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        attempt += 1;
    };

    let _ = done_tx.send(());
    if keyboard_thread.join().is_err() {
        warn!("keyboard thread panicked");
    }
    ready
}

/// Names of the serial ports present on the system, USB controllers first.
pub(crate) fn enumerate_serial_ports() -> Vec<String> {
    match available_ports() {
        Ok(mut ports) => {
            ports.sort_by_key(|p| !matches!(p.port_type, SerialPortType::UsbPort(_)));
            for p in &ports {
                if let SerialPortType::UsbPort(info) = &p.port_type {
                    debug!(
                        "{}: ({} / {})",
                        p.port_name,
                        info.manufacturer.as_deref().unwrap_or(""),
                        info.product.as_deref().unwrap_or("")
                    );
                }
            }
            ports.into_iter().map(|p| p.port_name).collect()
        }
        Err(ref e) => {
            info!("error: {}", e);
            Vec::new()
        }
    }
}

/// Open the monitor port, retrying while the board re-enumerates after a
/// reset, then give the board `settle_delay` to boot.
pub(crate) fn open_and_setup_port(
    path: &str,
    settings: &MonitorSettings,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to connect {} ({})", path, index);
            serialport::new(path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .timeout(settings.poll_interval)
                .open()
        },
    );
    match result {
        Ok(port) => {
            let baud_rate = port.baud_rate()?;
            if baud_rate != settings.baud_rate {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    format!(
                        "port {} runs at {} baud instead of {}",
                        path, baud_rate, settings.baud_rate
                    ),
                ));
            }
            info!("Connected to {} at {} baud", path, baud_rate);
            debug!("data_bits    : {:#?}", port.data_bits()?);
            debug!("stop_bits    : {:#?}", port.stop_bits()?);
            debug!("parity       : {:#?}", port.parity()?);
            debug!("flow control : {:#?}", port.flow_control()?);

            if !settings.settle_delay.is_zero() {
                debug!("Letting the board settle for {:?}", settings.settle_delay);
                thread::sleep(settings.settle_delay);
            }
            Ok(port)
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            info!(
                "Failed to open the port after {:?} and {} tries: {}",
                total_delay, tries, error,
            );
            Err(error)
        }
        Err(retry::Error::Internal(message)) => {
            info!("Internal retry error while opening port: {}", message);
            Err(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "internal error while retrying to open the port",
            ))
        }
    }
}

//==============================================================================
// Private stuff
//==============================================================================

/// A spinner in the station's console style.
fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[PV] {spinner:.blue} {msg}"),
    );
    pb
}

fn check_requested_port(ports: &[String], path: &str) -> bool {
    ports.iter().any(|detected| detected == path)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn requested_port_matches_by_name() {
    let ports = vec!["/dev/ttyUSB0".to_owned(), "/dev/ttyS0".to_owned()];
    assert!(check_requested_port(&ports, "/dev/ttyUSB0"));
    assert!(!check_requested_port(&ports, "/dev/ttyUSB1"));
    assert!(!check_requested_port(&[], "COM4"));
}

#[test]
fn longer_port_name_is_not_the_requested_port() {
    let ports = vec!["COM10".to_owned(), "/dev/ttyUSB10".to_owned()];
    assert!(!check_requested_port(&ports, "COM1"));
    assert!(!check_requested_port(&ports, "/dev/ttyUSB1"));
    assert!(check_requested_port(&ports, "COM10"));
}
