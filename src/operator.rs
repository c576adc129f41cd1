//! The human in the loop.
//!
//! The station never re-arms by itself: after each device the operator swaps
//! the board and confirms, and when no board can be found the operator
//! decides whether to look again.

use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm};
use log::warn;

use crate::run::ProvisioningRun;

// =============================================================================
// Public Interface
// =============================================================================

/// Blocking prompts answered by the operator.
pub trait Operator {
    /// Called at the end of every run. Returns `true` to provision the next
    /// device, `false` to stop the station.
    fn next_device(&mut self, run: &ProvisioningRun) -> bool;
    /// Called when no device could be found. Returns `true` to look again.
    fn retry_detection(&mut self) -> bool;
}

/// Asks on the terminal.
#[derive(Debug, Default)]
pub struct ConsoleOperator;
impl Operator for ConsoleOperator {
    fn next_device(&mut self, run: &ProvisioningRun) -> bool {
        let prompt = if run.is_pass() {
            format!(
                "Device {} done. Plug the next device and continue?",
                style(run.port()).cyan()
            )
        } else {
            format!(
                "Device {} {}. Plug the next device and continue?",
                style(run.port()).cyan(),
                style("rejected").red()
            )
        };
        confirm(&prompt)
    }

    fn retry_detection(&mut self) -> bool {
        confirm("No device found. Look again?")
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// `Esc`, `q` or a broken terminal count as "no".
fn confirm(prompt: &str) -> bool {
    let theme = ColorfulTheme::default();
    match Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(true)
        .interact_on_opt(&Term::stderr())
    {
        Ok(answer) => answer.unwrap_or(false),
        Err(e) => {
            warn!("could not read the operator's answer: {}", e);
            false
        }
    }
}
