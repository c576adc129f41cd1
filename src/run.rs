//! The record of one device insertion.

use console::style;
use log::error;

use crate::{
    error::{ProvisionError, Severity, Stage, StageError},
    report::{CapturedReport, Verdict},
};

/// Everything learned while provisioning one device.
///
/// A run is created when a device is found and discarded once the operator
/// moves on to the next one; nothing is carried over between runs.
#[derive(Debug)]
pub struct ProvisioningRun {
    port: String,
    stages: Vec<Stage>,
    report: Option<CapturedReport>,
    verdict: Option<Verdict>,
    link: Option<String>,
    errors: Vec<StageError>,
    committed: bool,
}
impl ProvisioningRun {
    pub fn new(port: impl Into<String>) -> Self {
        ProvisioningRun {
            port: port.into(),
            stages: Vec::new(),
            report: None,
            verdict: None,
            link: None,
            errors: Vec::new(),
            committed: false,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// The stage the run is in, or ended in.
    pub fn stage(&self) -> Option<Stage> {
        self.stages.last().copied()
    }

    /// Every stage entered, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn visited(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn report(&self) -> Option<&CapturedReport> {
        self.report.as_ref()
    }

    /// `None` until the report was validated.
    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    /// Only a validated report with every check passing is a pass.
    pub fn is_pass(&self) -> bool {
        self.verdict.as_ref().map_or(false, Verdict::is_pass)
    }

    /// The failing checks of the verdict.
    pub fn failures(&self) -> &[String] {
        match &self.verdict {
            Some(verdict) => verdict.failures(),
            None => &[],
        }
    }

    /// The label QR payload obtained from the backend.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    /// `true` when an error ended the run early.
    pub fn aborted(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.severity() == Severity::FatalToRun)
    }

    /// `true` once the final image was written to the device.
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Print the outcome of the run and every error caught along the way.
    pub fn print_summary(&self) {
        println!(
            "[PV] {} device on {}",
            style("=====").dim(),
            style(&self.port).cyan()
        );
        for e in &self.errors {
            println!("[PV] {} {}", style("✗").red(), e);
        }
        let outcome = match (&self.verdict, self.committed) {
            (Some(Verdict::Pass), true) => style("PASS, final firmware committed".to_owned()).green(),
            (Some(Verdict::Pass), false) => {
                style("PASS, final firmware NOT committed".to_owned()).yellow()
            }
            (Some(verdict @ Verdict::Fail(_)), _) => style(verdict.to_string()).red(),
            (None, _) => style("ABORTED, no verdict".to_owned()).red(),
        };
        println!("[PV] {}", outcome.bold());
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub(crate) fn set_report(&mut self, report: CapturedReport) {
        self.report = Some(report);
    }

    pub(crate) fn set_verdict(&mut self, verdict: Verdict) {
        self.verdict = Some(verdict);
    }

    pub(crate) fn set_link(&mut self, link: Option<String>) {
        self.link = link;
    }

    pub(crate) fn set_committed(&mut self) {
        self.committed = true;
    }

    /// Log a caught error and keep it for the end of run summary.
    pub(crate) fn record(&mut self, stage: Stage, error: ProvisionError) {
        let e = StageError::new(stage, error);
        error!("{} ({:?})", e, e.severity());
        self.errors.push(e);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn new_run_is_clean() {
    let run = ProvisioningRun::new("/dev/ttyUSB0");
    assert_eq!(run.port(), "/dev/ttyUSB0");
    assert_eq!(run.stage(), None);
    assert!(run.report().is_none());
    assert!(!run.is_pass());
    assert!(run.failures().is_empty());
    assert!(!run.aborted());
    assert!(!run.committed());
}

#[test]
fn errors_keep_their_stage() {
    let mut run = ProvisioningRun::new("COM4");
    run.enter(Stage::Submit);
    run.record(Stage::Submit, ProvisionError::SubmissionError("503".into()));
    assert!(!run.aborted());
    run.enter(Stage::Erase);
    run.record(Stage::Erase, ProvisionError::TransportError("gone".into()));
    assert!(run.aborted());
    assert_eq!(run.stage(), Some(Stage::Erase));
    let stages: Vec<Stage> = run.errors().iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec![Stage::Submit, Stage::Erase]);
}

#[test]
fn failing_verdict_is_not_a_pass() {
    let mut run = ProvisioningRun::new("COM4");
    run.set_verdict(Verdict::Fail(vec!["wifi_passed".into()]));
    assert!(!run.is_pass());
    assert_eq!(run.failures(), &["wifi_passed".to_owned()][..]);
    run.set_verdict(Verdict::Pass);
    assert!(run.is_pass());
}
