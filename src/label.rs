//! Device label printing.
//!
//! Rendering the QR code and driving the label printer are left to an
//! external program; this module composes the label content and hands it
//! over.

use std::{path::PathBuf, process::Command};

use log::{debug, info};

use crate::{
    error::{ProvisionError, Result},
    report::CapturedReport,
    settings::LabelSettings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// Everything needed to print one device label.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LabelJob {
    /// Encoded as a QR code. Empty when the backend did not provide a link.
    pub qr_payload: String,
    /// Human readable text printed next to the QR code.
    pub text: Option<String>,
    /// Printer selector; `None` lets the printing program pick its default.
    pub printer: Option<String>,
    /// Label template understood by the printing program.
    pub template: Option<PathBuf>,
}
impl LabelJob {
    /// Compose the label for a device from its report and the link returned
    /// by the backend.
    pub fn for_device(report: &CapturedReport, link: Option<&str>, settings: &LabelSettings) -> Self {
        LabelJob {
            qr_payload: link.unwrap_or_default().to_owned(),
            text: report
                .mac_address()
                .map(|mac| label_text(mac, &settings.ssid_prefix, &settings.extra_lines)),
            printer: settings.printer.clone(),
            template: settings.template.clone(),
        }
    }
}

/// Prints device labels.
pub trait LabelPrinter {
    fn print(&mut self, job: &LabelJob) -> Result<()>;
}

/// Delegates printing to an external program:
///
/// ```text
/// <program> [args...] --qr <payload> [--text <text>] [--printer <name>] [--template <path>]
/// ```
#[derive(Debug, Clone)]
pub struct CommandLabelPrinter {
    program: String,
    leading_args: Vec<String>,
}
impl CommandLabelPrinter {
    pub fn new(command: &[String]) -> Result<Self> {
        let mut parts = command.iter().cloned();
        let program = parts
            .next()
            .ok_or_else(|| ProvisionError::LabelPrintError("no label command configured".into()))?;
        Ok(CommandLabelPrinter {
            program,
            leading_args: parts.collect(),
        })
    }

    fn args(&self, job: &LabelJob) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("--qr".into());
        args.push(job.qr_payload.clone());
        if let Some(text) = &job.text {
            args.push("--text".into());
            args.push(text.clone());
        }
        if let Some(printer) = &job.printer {
            args.push("--printer".into());
            args.push(printer.clone());
        }
        if let Some(template) = &job.template {
            args.push("--template".into());
            args.push(template.display().to_string());
        }
        args
    }
}
impl LabelPrinter for CommandLabelPrinter {
    fn print(&mut self, job: &LabelJob) -> Result<()> {
        let args = self.args(job);
        debug!("{} {:?}", self.program, args);
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|e| {
                ProvisionError::LabelPrintError(format!("could not run `{}`: {}", self.program, e))
            })?;
        if !status.success() {
            return Err(ProvisionError::LabelPrintError(status.to_string()));
        }
        info!("Label printed");
        Ok(())
    }
}

/// Used when no printing program is configured: shows the label content to
/// the operator so it can be written by hand.
#[derive(Debug, Default)]
pub struct ConsoleLabelPrinter;
impl LabelPrinter for ConsoleLabelPrinter {
    fn print(&mut self, job: &LabelJob) -> Result<()> {
        println!("=========== LABEL ===========");
        println!("QR: {}", job.qr_payload);
        if let Some(text) = &job.text {
            println!("{}", text);
        }
        println!("=============================");
        Ok(())
    }
}

/// The SSID the device advertises: the prefix followed by the last three
/// octets of its MAC address.
pub fn device_ssid(mac: &str, prefix: &str) -> String {
    let octets: Vec<&str> = mac.split(':').collect();
    let tail = &octets[octets.len().saturating_sub(3)..];
    format!("{}{}", prefix, tail.join(":"))
}

// =============================================================================
// Private stuff
// =============================================================================

fn label_text(mac: &str, ssid_prefix: &str, extra_lines: &[String]) -> String {
    let mut lines = vec![
        format!("MAC:{}", mac),
        format!("SSID: {}", device_ssid(mac, ssid_prefix)),
    ];
    lines.extend(extra_lines.iter().cloned());
    lines.join("\n")
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> CapturedReport {
        CapturedReport::parse(r#"{"mac_address":"24:6F:28:AA:BB:CC"}"#).unwrap()
    }

    #[test]
    fn ssid_uses_last_three_octets() {
        assert_eq!(device_ssid("24:6F:28:AA:BB:CC", "RCD-"), "RCD-AA:BB:CC");
        assert_eq!(device_ssid("BB:CC", "RCD-"), "RCD-BB:CC");
    }

    #[test]
    fn label_for_device() {
        let settings = LabelSettings {
            extra_lines: vec!["Username: admin".into()],
            printer: Some("QL-800".into()),
            ..LabelSettings::default()
        };
        let job = LabelJob::for_device(&report(), Some("https://example.com/d/1"), &settings);
        assert_eq!(job.qr_payload, "https://example.com/d/1");
        assert_eq!(
            job.text.as_deref(),
            Some("MAC:24:6F:28:AA:BB:CC\nSSID: RCD-AA:BB:CC\nUsername: admin")
        );
        assert_eq!(job.printer.as_deref(), Some("QL-800"));
    }

    #[test]
    fn missing_link_gives_an_empty_qr_payload() {
        let job = LabelJob::for_device(&report(), None, &LabelSettings::default());
        assert_eq!(job.qr_payload, "");
    }

    #[test]
    fn command_arguments() {
        let printer = CommandLabelPrinter::new(&["print-label".to_owned(), "-q".to_owned()]).unwrap();
        let job = LabelJob {
            qr_payload: "link".into(),
            text: Some("MAC:x".into()),
            printer: None,
            template: Some(PathBuf::from("label.lbx")),
        };
        assert_eq!(
            printer.args(&job),
            vec!["-q", "--qr", "link", "--text", "MAC:x", "--template", "label.lbx"]
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandLabelPrinter::new(&[]).is_err());
    }
}
