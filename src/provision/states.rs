//! States for the `provcom` provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope. The public interface of the
//! provisioning state machine is provided by
//! [`provision`](crate::provision).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.
//!
//! No state lets an error escape: errors are recorded in the run with the
//! stage they happened in, and the returned event decides how much of the
//! run is left.

use std::io;

use console::style;
use log::{info, warn};

use super::events::*;

use crate::{
    capture::FrameCapture,
    collaborators::Collaborators,
    error::{ProvisionError, Stage},
    flasher::{FlashController, FlashPlan},
    image::{remove_stale_plaintext, DecryptedImage, EncryptedImage},
    label::LabelJob,
    report::{CapturedReport, Verdict},
    run::ProvisioningRun,
    settings::Settings,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// The state does its work against the `collab`orators, records what it
    /// learned in the `run`, and requests a transition to a `new state` by
    /// returning the appropriate `event`.
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event;
}

// Erase State =================================================================

/// The first state of a run: wipe the whole flash.
///
///  * **[`FlashFactoryEvent`] => [`FlashFactoryState`]** on success,
///  * **[`DoneEvent`] => [`DoneState`]** when the erase failed, which is
///    fatal to the run.
#[derive(Debug)]
pub(crate) struct EraseState {}
impl Runnable for EraseState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> Erase");
        run.enter(Stage::Erase);
        let port = run.port().to_owned();
        println!("[PV] 🧹 Erasing flash on {}", style(&port).cyan());

        match flash_controller(settings, collab).erase(&port) {
            Ok(()) => Event::FlashFactory(FlashFactoryEvent {}),
            Err(e) => {
                run.record(Stage::Erase, e);
                done(run)
            }
        }
    }
}

// FlashFactory State ==========================================================

/// Write the diagnostic firmware. There is no retry on this path.
///
///  * **[`ResetDeviceEvent`] => [`ResetDeviceState`]** on success,
///  * **[`DoneEvent`] => [`DoneState`]** on failure, fatal to the run.
#[derive(Debug)]
pub(crate) struct FlashFactoryState {}
impl Runnable for FlashFactoryState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> FlashFactory");
        run.enter(Stage::FlashFactory);
        let port = run.port().to_owned();
        println!("[PV] ⚡ Flashing the diagnostic firmware");

        match flash_controller(settings, collab).flash_factory(&port, &settings.factory_plan) {
            Ok(()) => Event::ResetDevice(ResetDeviceEvent {}),
            Err(e) => {
                run.record(Stage::FlashFactory, e);
                done(run)
            }
        }
    }
}

// ResetDevice State ===========================================================

/// Start the diagnostic firmware. Best effort.
///
///  * **[`CaptureReportEvent`] => [`CaptureReportState`]** always.
#[derive(Debug)]
pub(crate) struct ResetDeviceState {}
impl Runnable for ResetDeviceState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> ResetDevice");
        run.enter(Stage::ResetDevice);
        let port = run.port().to_owned();

        if let Err(e) = flash_controller(settings, collab).reset(&port) {
            run.record(Stage::ResetDevice, e);
        }
        Event::CaptureReport(CaptureReportEvent {})
    }
}

// CaptureReport State =========================================================

/// Open the monitor port, show the diagnostic output to the operator and
/// extract the self-test report. The port is closed before leaving the
/// state, on every path.
///
///  * **[`ValidateEvent`] => [`ValidateState`]** with the report stored in
///    the run,
///  * **[`DoneEvent`] => [`DoneState`]** when the port cannot be opened, is
///    disconnected, or the report is not well formed. All fatal to the run.
#[derive(Debug)]
pub(crate) struct CaptureReportState {}
impl Runnable for CaptureReportState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> CaptureReport");
        run.enter(Stage::CaptureReport);
        let port = run.port().to_owned();
        println!(
            "[PV] 📡 Waiting for the self-test report on {}",
            style(&port).cyan()
        );

        let captured = collab
            .monitor
            .open(&port, &settings.monitor)
            .and_then(|mut source| {
                FrameCapture::new().capture(
                    &mut *source,
                    &mut io::stdout(),
                    settings.monitor.poll_interval,
                )
            })
            .and_then(|text| CapturedReport::parse(&text));

        match captured {
            Ok(report) => {
                info!(
                    "Report captured for {} ({} fields)",
                    report.mac_address().unwrap_or("<unknown MAC>"),
                    report.fields().len()
                );
                run.set_report(report);
                Event::Validate(ValidateEvent {})
            }
            Err(e) => {
                run.record(Stage::CaptureReport, e);
                done(run)
            }
        }
    }
}

// Validate State ==============================================================

/// Check the report against the required checks. Always produces a verdict
/// and never stops the run.
///
///  * **[`SubmitLabelEvent`] => [`SubmitLabelState`]** always.
#[derive(Debug)]
pub(crate) struct ValidateState {}
impl Runnable for ValidateState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        _collab: &mut Collaborators,
    ) -> Event {
        info!("=> Validate");
        run.enter(Stage::Validate);

        let verdict = match run.report() {
            Some(report) => report.validate(&settings.required_checks),
            None => Verdict::Fail(settings.required_checks.clone()),
        };
        match &verdict {
            Verdict::Pass => println!("[PV] ✅ {}", style("All checks passed").green()),
            Verdict::Fail(failures) => {
                for check in failures {
                    println!("[PV] ❌ {} {}", style(check).red(), style("failed").dim());
                }
            }
        }
        if let Some(e) = verdict.to_error() {
            info!("{}", e);
        }
        run.set_verdict(verdict);
        Event::SubmitLabel(SubmitLabelEvent {})
    }
}

// SubmitLabel State ===========================================================

/// Submit the report to the backend, then print the device label. Each call
/// is guarded on its own: a failing submission still prints a label (with an
/// empty QR payload), and a failing printer does not hide the submission
/// result.
///
///  * **[`DecideEvent`] => [`DecideState`]** always.
#[derive(Debug)]
pub(crate) struct SubmitLabelState {}
impl Runnable for SubmitLabelState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> SubmitLabel");
        run.enter(Stage::Submit);
        let report = match run.report() {
            Some(report) => report.clone(),
            None => return Event::Decide(DecideEvent {}),
        };

        match collab.backend.submit(&report) {
            Ok(submission) => {
                println!("[PV] ☁️  Report submitted");
                if submission.link.is_none() {
                    warn!("the backend did not return a link for the label");
                }
                run.set_link(submission.link);
            }
            Err(e) => run.record(Stage::Submit, e),
        }

        run.enter(Stage::Label);
        let job = LabelJob::for_device(&report, run.link(), &settings.label);
        match collab.printer.print(&job) {
            Ok(()) => println!("[PV] 🏷️  Label printed"),
            Err(e) => run.record(Stage::Label, e),
        }
        Event::Decide(DecideEvent {})
    }
}

// Decide State ================================================================

/// Gate the final firmware commit on the verdict.
///
///  * **[`DecryptFinalEvent`] => [`DecryptFinalState`]** on a pass,
///  * **[`DoneEvent`] => [`DoneState`]** otherwise.
#[derive(Debug)]
pub(crate) struct DecideState {}
impl Runnable for DecideState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        _settings: &Settings,
        _collab: &mut Collaborators,
    ) -> Event {
        info!("=> Decide");
        run.enter(Stage::Decide);
        if run.is_pass() {
            Event::DecryptFinal(DecryptFinalEvent {})
        } else {
            info!(
                "Final firmware withheld, failed checks: {}",
                run.failures().join(", ")
            );
            done(run)
        }
    }
}

// DecryptFinal State ==========================================================

/// Decrypt the final image into the working directory and check its magic
/// byte. A failure only aborts the commit.
///
///  * **[`FlashFinalEvent`] => [`FlashFinalState`]** with the plaintext
///    image,
///  * **[`DoneEvent`] => [`DoneState`]** on failure.
#[derive(Debug)]
pub(crate) struct DecryptFinalState {}
impl Runnable for DecryptFinalState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        _collab: &mut Collaborators,
    ) -> Event {
        info!("=> DecryptFinal");
        run.enter(Stage::DecryptFinal);
        let image = &settings.final_image;
        let plaintext = image.decrypted_path();
        if let Err(e) = remove_stale_plaintext(&plaintext) {
            warn!("Could not remove {}: {}", plaintext.display(), e);
        }

        let decrypted = image
            .key
            .as_ref()
            .ok_or_else(|| ProvisionError::DecryptionFailure("no image key configured".into()))
            .and_then(|key| {
                let encrypted = EncryptedImage::open(&image.encrypted_image)?;
                println!(
                    "[PV] 🔓 Decrypting {} ({} bytes)",
                    style(encrypted.path().display()).cyan(),
                    encrypted.len()
                );
                encrypted.decrypt(key, &plaintext)
            });
        match decrypted {
            Ok(image) => Event::FlashFinal(FlashFinalEvent { image }),
            Err(e) => {
                run.record(Stage::DecryptFinal, e);
                done(run)
            }
        }
    }
}

// FlashFinal State ============================================================

/// Commit the final image, retrying once at the fallback baud rate. The
/// plaintext image is removed when leaving the state, whatever the outcome.
///
///  * **[`ResetFinalEvent`] => [`ResetFinalState`]** once committed,
///  * **[`DoneEvent`] => [`DoneState`]** on failure. The factory firmware
///    stays on the device.
#[derive(Debug)]
pub(crate) struct FlashFinalState {
    /// Consumed when the state runs.
    pub image: Option<DecryptedImage>,
}
impl Runnable for FlashFinalState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> FlashFinal");
        run.enter(Stage::FlashFinal);
        let image = match self.image.take() {
            Some(image) => image,
            None => {
                run.record(
                    Stage::FlashFinal,
                    ProvisionError::DecryptionFailure("no decrypted image to flash".into()),
                );
                return done(run);
            }
        };
        let port = run.port().to_owned();
        println!("[PV] ⚡ Flashing the final firmware");

        let plan = FlashPlan::combined(image.path());
        let result = flash_controller(settings, collab).flash_final(&port, &plan);
        drop(image);

        match result {
            Ok(()) => {
                run.set_committed();
                println!("[PV] ✅ {}", style("Final firmware committed").green());
                Event::ResetFinal(ResetFinalEvent {})
            }
            Err(e) => {
                run.record(Stage::FlashFinal, e);
                done(run)
            }
        }
    }
}

// ResetFinal State ============================================================

/// Start the production firmware. Best effort.
///
///  * **[`DoneEvent`] => [`DoneState`]** always.
#[derive(Debug)]
pub(crate) struct ResetFinalState {}
impl Runnable for ResetFinalState {
    fn run(
        &mut self,
        run: &mut ProvisioningRun,
        settings: &Settings,
        collab: &mut Collaborators,
    ) -> Event {
        info!("=> ResetFinal");
        run.enter(Stage::ResetFinal);
        let port = run.port().to_owned();

        if let Err(e) = flash_controller(settings, collab).reset(&port) {
            run.record(Stage::ResetFinal, e);
        }
        done(run)
    }
}

// Done State ==================================================================

#[derive(Debug, Copy, Clone)]
pub(crate) struct DoneState {
    pub with_error: bool,
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn run(
        &mut self,
        _run: &mut ProvisioningRun,
        _settings: &Settings,
        _collab: &mut Collaborators,
    ) -> Event {
        info!(
            "=> Done with{}errors",
            if self.with_error { " " } else { " no " }
        );
        Event::Exit(ExitEvent {
            with_error: self.with_error,
        })
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<FlashFactoryEvent> for FlashFactoryState {
    fn from(_: FlashFactoryEvent) -> Self {
        FlashFactoryState {}
    }
}

impl From<ResetDeviceEvent> for ResetDeviceState {
    fn from(_: ResetDeviceEvent) -> Self {
        ResetDeviceState {}
    }
}

impl From<CaptureReportEvent> for CaptureReportState {
    fn from(_: CaptureReportEvent) -> Self {
        CaptureReportState {}
    }
}

impl From<ValidateEvent> for ValidateState {
    fn from(_: ValidateEvent) -> Self {
        ValidateState {}
    }
}

impl From<SubmitLabelEvent> for SubmitLabelState {
    fn from(_: SubmitLabelEvent) -> Self {
        SubmitLabelState {}
    }
}

impl From<DecideEvent> for DecideState {
    fn from(_: DecideEvent) -> Self {
        DecideState {}
    }
}

impl From<DecryptFinalEvent> for DecryptFinalState {
    fn from(_: DecryptFinalEvent) -> Self {
        DecryptFinalState {}
    }
}

impl From<FlashFinalEvent> for FlashFinalState {
    fn from(event: FlashFinalEvent) -> Self {
        FlashFinalState {
            image: Some(event.image),
        }
    }
}

impl From<ResetFinalEvent> for ResetFinalState {
    fn from(_: ResetFinalEvent) -> Self {
        ResetFinalState {}
    }
}

impl From<DoneEvent> for DoneState {
    fn from(event: DoneEvent) -> Self {
        DoneState {
            with_error: event.with_errors,
            should_exit: false,
        }
    }
}
impl From<ExitEvent> for DoneState {
    fn from(event: ExitEvent) -> Self {
        DoneState {
            with_error: event.with_error,
            should_exit: true,
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn flash_controller<'a>(
    settings: &'a Settings,
    collab: &'a mut Collaborators,
) -> FlashController<'a> {
    FlashController::new(
        &mut *collab.flash_tool,
        &settings.chip,
        settings.flash.baud_rate,
        settings.flash.fallback_baud_rate,
    )
}

fn done(run: &ProvisioningRun) -> Event {
    Event::Done(DoneEvent {
        with_errors: !run.errors().is_empty(),
    })
}
