//! The self-test report and its validation.

use std::fmt;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::error::{ProvisionError, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// The keys that must all be present and truthy for a board to pass.
pub const REQUIRED_CHECKS: [&str; 13] = [
    "mac_address",
    "nvs_passed",
    "buzzer_passed",
    "red_led_passed",
    "green_led_passed",
    "blue_led_passed",
    "button_passed",
    "rtc_passed",
    "coel_comm_passed",
    "wifi_passed",
    "spiffs_passed",
    "dht22_passed",
    "ds18b20_passed",
];

/// The default list of required checks, as owned strings.
pub fn default_required_checks() -> Vec<String> {
    REQUIRED_CHECKS.iter().map(|k| (*k).to_owned()).collect()
}

/// The JSON object printed by the diagnostic firmware at the end of its
/// self-tests.
///
/// A report cannot be modified once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedReport {
    fields: Map<String, Value>,
}
impl CapturedReport {
    /// Parse the text of a captured frame. Anything but a JSON object is a
    /// [`ProvisionError::MalformedReport`].
    pub fn parse(text: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => Ok(CapturedReport { fields }),
            Ok(other) => Err(ProvisionError::MalformedReport(format!(
                "expected a JSON object, got `{}`",
                other
            ))),
            Err(e) => Err(ProvisionError::MalformedReport(e.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The board MAC address, when reported as a string.
    pub fn mac_address(&self) -> Option<&str> {
        self.get("mac_address").and_then(Value::as_str)
    }

    /// Check every key of `required` against the report.
    pub fn validate<S: AsRef<str>>(&self, required: &[S]) -> Verdict {
        let failures: Vec<String> = required
            .iter()
            .map(|key| key.as_ref())
            .filter(|key: &&str| !self.get(key).map_or(false, is_truthy))
            .map(str::to_owned)
            .collect();
        if failures.is_empty() {
            debug!("all {} required checks passed", required.len());
            Verdict::Pass
        } else {
            for key in &failures {
                warn!("check `{}` failed or missing", key);
            }
            Verdict::Fail(failures)
        }
    }

    /// The report as a JSON value, for submission.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// The outcome of validating a report.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    /// The required checks that are missing or falsy, in the order they were
    /// required.
    Fail(Vec<String>),
}
impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn failures(&self) -> &[String] {
        match self {
            Verdict::Pass => &[],
            Verdict::Fail(failures) => failures,
        }
    }

    /// The failures as an error, `None` on pass.
    pub fn to_error(&self) -> Option<ProvisionError> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(failures) => Some(ProvisionError::ValidationFailed(failures.clone())),
        }
    }
}
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail(failures) => write!(f, "FAIL ({})", failures.join(", ")),
        }
    }
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
