//! Erase, write and reset operations against the board.
//!
//! The protocol spoken with the chip's ROM bootloader is delegated to an
//! external flashing tool, modelled by the [`FlashTool`] capability trait. The
//! default implementation, [`EspTool`], runs `esptool.py` as a child process
//! and waits for it. Tests swap in a scripted tool.
//!
//! [`FlashController`] layers the provisioning policies on top of a tool:
//!
//! * the factory plan is written once and any failure is surfaced as is,
//! * the final plan is written at the preferred baud rate and, on failure,
//!   retried exactly once at the fallback baud rate,
//! * reset is best effort.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};
use retry::{delay, retry_with_index};

use crate::error::{FlashOperation, ProvisionError, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// Preferred flashing speed.
pub const DEFAULT_FLASH_BAUD: u32 = 460_800;

/// Speed used for the single retry after a failure at the preferred speed.
pub const FALLBACK_FLASH_BAUD: u32 = 115_200;

/// One image to be written at a flash offset.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashSegment {
    pub offset: u32,
    pub path: PathBuf,
}
impl FlashSegment {
    pub fn new(offset: u32, path: impl Into<PathBuf>) -> Self {
        FlashSegment {
            offset,
            path: path.into(),
        }
    }
}

/// Write options passed through to the flashing tool for a plan.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteOptions {
    /// Compress data during transfer.
    pub compress: bool,
    /// Reset strategy before connecting (e.g. `default_reset`).
    pub before: Option<String>,
    /// Reset strategy after writing (e.g. `hard_reset`).
    pub after: Option<String>,
    pub flash_mode: Option<String>,
    pub flash_freq: Option<String>,
    pub flash_size: Option<String>,
}
impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            compress: true,
            before: None,
            after: None,
            flash_mode: None,
            flash_freq: None,
            flash_size: None,
        }
    }
}

/// An ordered list of images to write.
///
/// Segments are written in the order they were added: the partition table
/// must be in place before the application that depends on it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashPlan {
    pub name: String,
    pub segments: Vec<FlashSegment>,
    pub options: WriteOptions,
}
impl FlashPlan {
    pub fn new(name: impl Into<String>) -> Self {
        FlashPlan {
            name: name.into(),
            segments: Vec::new(),
            options: WriteOptions::default(),
        }
    }

    pub fn segment(mut self, offset: u32, path: impl Into<PathBuf>) -> Self {
        self.segments.push(FlashSegment::new(offset, path));
        self
    }

    pub fn options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// The diagnostic firmware build found under `dir`, as produced by the
    /// ESP-IDF build system.
    pub fn factory(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        FlashPlan::new("factory")
            .segment(0x1000, dir.join("bootloader").join("bootloader.bin"))
            .segment(0xf000, dir.join("partition_table").join("partition-table.bin"))
            .segment(0x14000, dir.join("ota_data_initial.bin"))
            .segment(0x20000, dir.join("rcd-firmware.bin"))
            .segment(0x325000, dir.join("site.bin"))
    }

    /// A single combined image written at offset zero.
    pub fn combined(image: impl Into<PathBuf>) -> Self {
        FlashPlan::new("final")
            .segment(0x0, image)
            .options(WriteOptions {
                compress: false,
                before: Some("default_reset".into()),
                after: Some("hard_reset".into()),
                flash_mode: Some("dio".into()),
                flash_freq: Some("40m".into()),
                flash_size: Some("8MB".into()),
            })
    }

    /// Check that every image of the plan is present on disk.
    pub fn check_files(&self) -> Result<()> {
        match self.segments.iter().find(|s| !s.path.is_file()) {
            Some(missing) => Err(ProvisionError::FirmwareNotFound(missing.path.clone())),
            None => Ok(()),
        }
    }
}
impl fmt::Display for FlashPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.name)?;
        for (i, s) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:#x}: {}", s.offset, s.path.display())?;
        }
        f.write_str(")")
    }
}

/// The capabilities required from an external flashing tool.
///
/// All calls block until the tool is done. They must not be issued
/// concurrently against the same port.
pub trait FlashTool {
    /// Check that a supported chip answers on `port`.
    fn detect(&mut self, port: &str) -> Result<()>;
    /// Erase the whole flash.
    fn erase(&mut self, port: &str, chip: &str) -> Result<()>;
    /// Write all segments of `plan`, in order, at `baud`.
    fn write(&mut self, port: &str, chip: &str, plan: &FlashPlan, baud: u32) -> Result<()>;
    /// Reset the chip and let the application run.
    fn reset(&mut self, port: &str) -> Result<()>;
}

/// Runs `esptool.py` (or any compatible command line) as a child process.
#[derive(Debug, Clone)]
pub struct EspTool {
    program: String,
    leading_args: Vec<String>,
}
impl EspTool {
    /// `command` is the program followed by any fixed leading arguments, e.g.
    /// `["python", "-m", "esptool"]`.
    pub fn new(command: &[String]) -> Self {
        let mut parts = command.iter().cloned();
        EspTool {
            program: parts.next().unwrap_or_else(|| "esptool.py".into()),
            leading_args: parts.collect(),
        }
    }

    fn exec(&self, operation: FlashOperation, baud: Option<u32>, args: Vec<String>) -> Result<()> {
        debug!("{} {} {}", self.program, self.leading_args.join(" "), args.join(" "));
        let status = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .status()
            .map_err(|e| ProvisionError::FlashToolError {
                operation,
                baud,
                message: format!("could not run `{}`: {}", self.program, e),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::FlashToolError {
                operation,
                baud,
                message: status.to_string(),
            })
        }
    }
}
impl Default for EspTool {
    fn default() -> Self {
        EspTool::new(&[])
    }
}
impl FlashTool for EspTool {
    fn detect(&mut self, port: &str) -> Result<()> {
        self.exec(
            FlashOperation::Detect,
            None,
            args(&["--port", port, "chip_id"]),
        )
    }

    fn erase(&mut self, port: &str, chip: &str) -> Result<()> {
        self.exec(
            FlashOperation::Erase,
            None,
            args(&["--chip", chip, "--port", port, "erase_flash"]),
        )
    }

    fn write(&mut self, port: &str, chip: &str, plan: &FlashPlan, baud: u32) -> Result<()> {
        self.exec(
            FlashOperation::Write,
            Some(baud),
            write_flash_args(port, chip, plan, baud),
        )
    }

    fn reset(&mut self, port: &str) -> Result<()> {
        self.exec(FlashOperation::Reset, None, args(&["--port", port, "run"]))
    }
}

/// Applies the provisioning policies to a [`FlashTool`].
pub struct FlashController<'a> {
    tool: &'a mut dyn FlashTool,
    chip: &'a str,
    baud_rate: u32,
    fallback_baud_rate: u32,
}
impl<'a> FlashController<'a> {
    pub fn new(
        tool: &'a mut dyn FlashTool,
        chip: &'a str,
        baud_rate: u32,
        fallback_baud_rate: u32,
    ) -> Self {
        FlashController {
            tool,
            chip,
            baud_rate,
            fallback_baud_rate,
        }
    }

    /// Erase the whole chip. Failure is fatal to the run.
    pub fn erase(&mut self, port: &str) -> Result<()> {
        info!("Erasing flash on {}", port);
        self.tool.erase(port, self.chip)
    }

    /// Write the factory plan at the preferred speed, without retrying.
    pub fn flash_factory(&mut self, port: &str, plan: &FlashPlan) -> Result<()> {
        plan.check_files()?;
        info!("Flashing {} at {} baud", plan, self.baud_rate);
        self.tool.write(port, self.chip, plan, self.baud_rate)
    }

    /// Write the final plan at the preferred speed, then once more at the
    /// fallback speed if that failed. There is never a third attempt.
    pub fn flash_final(&mut self, port: &str, plan: &FlashPlan) -> Result<()> {
        plan.check_files()?;
        let bauds = [self.baud_rate, self.fallback_baud_rate];
        let retries = if self.baud_rate == self.fallback_baud_rate {
            0
        } else {
            1
        };
        let tool = &mut *self.tool;
        let chip = self.chip;

        let result = retry_with_index(
            delay::Fixed::from_millis(500).take(retries),
            |index| -> Result<u32> {
                // `retry` counts attempts from 1
                let baud = bauds[(index as usize - 1).min(1)];
                info!("Flashing {} at {} baud (attempt {})", plan, baud, index);
                match tool.write(port, chip, plan, baud) {
                    Ok(()) => Ok(baud),
                    Err(e) => {
                        warn!("Flashing at {} baud failed: {}", baud, e);
                        Err(e)
                    }
                }
            },
        );
        match result {
            Ok(baud) => {
                info!("Final image written at {} baud", baud);
                Ok(())
            }
            Err(retry::Error::Operation {
                error,
                total_delay,
                tries,
            }) => {
                info!(
                    "Giving up on the final image after {} tries in {:?}",
                    tries, total_delay
                );
                Err(error)
            }
            Err(retry::Error::Internal(message)) => Err(ProvisionError::FlashToolError {
                operation: FlashOperation::Write,
                baud: None,
                message,
            }),
        }
    }

    /// Reset the chip. Best effort: callers log the error and carry on.
    pub fn reset(&mut self, port: &str) -> Result<()> {
        info!("Resetting the device on {}", port);
        self.tool.reset(port)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn write_flash_args(port: &str, chip: &str, plan: &FlashPlan, baud: u32) -> Vec<String> {
    let baud = baud.to_string();
    let mut out = args(&["--chip", chip, "--port", port, "--baud", baud.as_str()]);
    let opts = &plan.options;
    if let Some(before) = &opts.before {
        out.extend(args(&["--before", before.as_str()]));
    }
    if let Some(after) = &opts.after {
        out.extend(args(&["--after", after.as_str()]));
    }
    out.push("write_flash".into());
    if opts.compress {
        out.push("-z".into());
    }
    if let Some(mode) = &opts.flash_mode {
        out.extend(args(&["--flash_mode", mode.as_str()]));
    }
    if let Some(freq) = &opts.flash_freq {
        out.extend(args(&["--flash_freq", freq.as_str()]));
    }
    if let Some(size) = &opts.flash_size {
        out.extend(args(&["--flash_size", size.as_str()]));
    }
    for segment in &plan.segments {
        out.push(format!("{:#x}", segment.offset));
        out.push(segment.path.display().to_string());
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
