//! Settings of the provisioning station: serial ports, flashing, firmware
//! images, secrets and collaborators.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values. Once finalized, the settings are
//! immutable and shared by all the stages of the provisioning state machine.

use std::{fmt, path::PathBuf, time::Duration};

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::{
    flasher::{FlashPlan, DEFAULT_FLASH_BAUD, FALLBACK_FLASH_BAUD},
    image::ImageKey,
    report::default_required_checks,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The serial line used to monitor the diagnostic firmware output. This is
/// independent of the speed used for flashing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MonitorSettings {
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,
    /// Time given to the board to reboot after the port is opened.
    pub settle_delay: Duration,
    /// Wait between two polls of an idle port.
    pub poll_interval: Duration,
}

/// The external flashing tool and the speeds it is driven at.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashSettings {
    /// Program and leading arguments, e.g. `["esptool.py"]`.
    pub tool: Vec<String>,
    /// Preferred baud rate.
    pub baud_rate: u32,
    /// Baud rate for the single retry of the final image write.
    pub fallback_baud_rate: u32,
}

/// The encrypted production image and where its plaintext may live.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FinalImageSettings {
    /// The AES-CBC encrypted combined image.
    pub encrypted_image: PathBuf,
    /// Directory for the ephemeral plaintext image.
    pub work_dir: PathBuf,
    /// The pre-shared key and IV. Without it no final image is committed.
    pub key: Option<ImageKey>,
}
impl FinalImageSettings {
    /// Path of the plaintext image produced during a run.
    pub fn decrypted_path(&self) -> PathBuf {
        self.work_dir.join("firmware-combined-decrypted.bin")
    }
}

/// The backend the test reports are submitted to.
#[derive(Clone, Eq, PartialEq)]
pub struct ApiSettings {
    pub url: Option<String>,
    /// Sent in the `x-access-token` header.
    pub token: String,
    pub batch_number: String,
    /// The field of the response holding the link for the label QR code.
    pub link_field: String,
}
impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            url: None,
            token: String::new(),
            batch_number: String::new(),
            link_field: "auvoLink".into(),
        }
    }
}
impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("url", &self.url)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("batch_number", &self.batch_number)
            .field("link_field", &self.link_field)
            .finish()
    }
}

/// The device label.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LabelSettings {
    /// External printing program and its leading arguments. When empty the
    /// label is only shown on the console.
    pub command: Vec<String>,
    pub printer: Option<String>,
    pub template: Option<PathBuf>,
    pub ssid_prefix: String,
    /// Fixed lines appended to the label text.
    pub extra_lines: Vec<String>,
}
impl Default for LabelSettings {
    fn default() -> Self {
        LabelSettings {
            command: Vec::new(),
            printer: None,
            template: None,
            ssid_prefix: "RCD-".into(),
            extra_lines: Vec::new(),
        }
    }
}

/// Groups all settings used by `provcom` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path. When not set, every serial
    /// port is scanned for a board.
    pub path: Option<String>,
    /// Chip identifier passed to the flashing tool.
    pub chip: String,
    pub monitor: MonitorSettings,
    pub flash: FlashSettings,
    /// The diagnostic firmware images.
    pub factory_plan: FlashPlan,
    pub final_image: FinalImageSettings,
    /// The report keys that must be present and truthy.
    pub required_checks: Vec<String>,
    pub api: ApiSettings,
    pub label: LabelSettings,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use provcom::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyUSB0")
///     .batch_number("RCDCR103000724BR00002")
///     .finalize();
/// assert_eq!(settings.monitor.baud_rate, 115_200);
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder::new()
    }
}
impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                chip: "esp32".into(),
                monitor: MonitorSettings {
                    baud_rate: 115_200,
                    data_bits: DataBits::Eight,
                    flow_control: FlowControl::None,
                    parity: Parity::None,
                    stop_bits: StopBits::One,
                    settle_delay: Duration::from_secs(2),
                    poll_interval: Duration::from_millis(100),
                },
                flash: FlashSettings {
                    tool: vec!["esptool.py".into()],
                    baud_rate: DEFAULT_FLASH_BAUD,
                    fallback_baud_rate: FALLBACK_FLASH_BAUD,
                },
                factory_plan: FlashPlan::factory("build"),
                final_image: FinalImageSettings {
                    encrypted_image: PathBuf::from("final-firmware/firmware-combined.bin.enc"),
                    work_dir: PathBuf::from(".build"),
                    key: None,
                },
                required_checks: default_required_checks(),
                api: ApiSettings::default(),
                label: LabelSettings::default(),
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the chip identifier passed to the flashing tool
    pub fn chip<'a>(mut self, chip: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.chip = chip.into().into_owned();
        self
    }

    /// Set the monitor baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.monitor.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.monitor.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.monitor.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.monitor.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.monitor.stop_bits = stop_bits;
        self
    }

    /// Set the time given to the board to reboot before monitoring
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settings.monitor.settle_delay = delay;
        self
    }

    /// Set the wait between two polls of an idle monitor port
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.monitor.poll_interval = interval;
        self
    }

    /// Set the flashing tool command line (program and leading arguments)
    pub fn flash_tool<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.settings.flash.tool = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the preferred flashing baud rate
    pub fn flash_baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.flash.baud_rate = baud_rate;
        self
    }

    /// Set the flashing baud rate used for the final image retry
    pub fn fallback_baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.flash.fallback_baud_rate = baud_rate;
        self
    }

    /// Use the diagnostic firmware build found in `dir`
    pub fn factory_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.factory_plan = FlashPlan::factory(dir.into());
        self
    }

    /// Set an explicit diagnostic firmware plan
    pub fn factory_plan(mut self, plan: FlashPlan) -> Self {
        self.settings.factory_plan = plan;
        self
    }

    /// Set the path to the encrypted final image
    pub fn encrypted_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.final_image.encrypted_image = path.into();
        self
    }

    /// Set the directory where the plaintext image is written during a run
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.final_image.work_dir = dir.into();
        self
    }

    /// Set the pre-shared key of the final image
    pub fn image_key(mut self, key: ImageKey) -> Self {
        self.settings.final_image.key = Some(key);
        self
    }

    /// Replace the list of report keys that must pass
    pub fn required_checks<S: Into<String>>(mut self, checks: impl IntoIterator<Item = S>) -> Self {
        self.settings.required_checks = checks.into_iter().map(Into::into).collect();
        self
    }

    /// Set the backend URL reports are posted to
    pub fn api_url<'a>(mut self, url: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.api.url = Some(url.into().into_owned());
        self
    }

    /// Set the backend access token
    pub fn api_token<'a>(mut self, token: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.api.token = token.into().into_owned();
        self
    }

    /// Set the production batch the reports belong to
    pub fn batch_number<'a>(mut self, batch: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.api.batch_number = batch.into().into_owned();
        self
    }

    /// Set the response field holding the label link
    pub fn link_field<'a>(mut self, field: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.api.link_field = field.into().into_owned();
        self
    }

    /// Set the external label printing command line
    pub fn label_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.settings.label.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the label printer selector
    pub fn printer<'a>(mut self, printer: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.label.printer = Some(printer.into().into_owned());
        self
    }

    /// Set the label template
    pub fn label_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.settings.label.template = Some(template.into());
        self
    }

    /// Set the prefix of the SSID printed on the label
    pub fn ssid_prefix<'a>(mut self, prefix: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.label.ssid_prefix = prefix.into().into_owned();
        self
    }

    /// Append a fixed line to the label text
    pub fn label_line<'a>(mut self, line: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.label.extra_lines.push(line.into().into_owned());
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.path, None);
    assert_eq!(settings.chip, "esp32");
    assert_eq!(
        settings.monitor,
        MonitorSettings {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    );
    assert_eq!(settings.flash.baud_rate, 460_800);
    assert_eq!(settings.flash.fallback_baud_rate, 115_200);
    assert_eq!(settings.flash.tool, vec!["esptool.py".to_owned()]);
    assert_eq!(settings.factory_plan, FlashPlan::factory("build"));
    assert_eq!(settings.final_image.key, None);
    assert_eq!(settings.required_checks.len(), 13);
    assert_eq!(settings.api.link_field, "auvoLink");
    assert_eq!(settings.label.ssid_prefix, "RCD-");
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rates() {
    let settings = SettingsBuilder::new()
        .baud_rate(9_600)
        .flash_baud_rate(921_600)
        .fallback_baud_rate(230_400)
        .finalize();
    assert_eq!(settings.monitor.baud_rate, 9_600);
    assert_eq!(settings.flash.baud_rate, 921_600);
    assert_eq!(settings.flash.fallback_baud_rate, 230_400);
}

#[test]
fn line_settings() {
    let settings = SettingsBuilder::new()
        .data_bits(DataBits::Seven)
        .flow_control(FlowControl::Hardware)
        .stop_bits(StopBits::Two)
        .parity(Parity::Even)
        .finalize();
    assert_eq!(settings.monitor.data_bits, DataBits::Seven);
    assert_eq!(settings.monitor.flow_control, FlowControl::Hardware);
    assert_eq!(settings.monitor.stop_bits, StopBits::Two);
    assert_eq!(settings.monitor.parity, Parity::Even);
}

#[test]
fn flash_tool() {
    let settings = SettingsBuilder::new()
        .flash_tool(vec!["python", "-m", "esptool"])
        .finalize();
    assert_eq!(settings.flash.tool, vec!["python", "-m", "esptool"]);
}

#[test]
fn factory_dir() {
    let settings = SettingsBuilder::new().factory_dir("fvt").finalize();
    assert_eq!(
        settings.factory_plan.segments[0].path,
        PathBuf::from("fvt/bootloader/bootloader.bin")
    );
}

#[test]
fn final_image() {
    let key = ImageKey::new(b"0123456789abcdef", b"fedcba9876543210").unwrap();
    let settings = SettingsBuilder::new()
        .encrypted_image("fw.enc")
        .work_dir("/tmp/prov")
        .image_key(key.clone())
        .finalize();
    assert_eq!(settings.final_image.encrypted_image, PathBuf::from("fw.enc"));
    assert_eq!(
        settings.final_image.decrypted_path(),
        PathBuf::from("/tmp/prov/firmware-combined-decrypted.bin")
    );
    assert_eq!(settings.final_image.key, Some(key));
}

#[test]
fn api() {
    let settings = SettingsBuilder::new()
        .api_url("https://backend.example.com/save")
        .api_token("secret-token")
        .batch_number("B-1")
        .link_field("link")
        .finalize();
    assert_eq!(settings.api.url.as_deref(), Some("https://backend.example.com/save"));
    assert_eq!(settings.api.batch_number, "B-1");
    assert_eq!(settings.api.link_field, "link");
    assert!(!format!("{:?}", settings.api).contains("secret-token"));
}

#[test]
fn label() {
    let settings = SettingsBuilder::new()
        .label_command(vec!["print-label"])
        .printer("QL-800")
        .label_template("label.lbx")
        .ssid_prefix("DEV-")
        .label_line("Username: admin")
        .finalize();
    assert_eq!(settings.label.command, vec!["print-label"]);
    assert_eq!(settings.label.printer.as_deref(), Some("QL-800"));
    assert_eq!(settings.label.template, Some(PathBuf::from("label.lbx")));
    assert_eq!(settings.label.ssid_prefix, "DEV-");
    assert_eq!(settings.label.extra_lines, vec!["Username: admin"]);
}

#[test]
fn required_checks() {
    let settings = SettingsBuilder::new()
        .required_checks(vec!["nvs_passed"])
        .finalize();
    assert_eq!(settings.required_checks, vec!["nvs_passed"]);
}
