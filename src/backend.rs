//! Submission of test reports to the production backend.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{ProvisionError, Result},
    report::CapturedReport,
    settings::ApiSettings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The backend's answer to a submitted report.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Submission {
    /// The link to encode in the device label QR code. The backend may leave
    /// it out.
    pub link: Option<String>,
}

/// Records test reports against a production batch.
pub trait BackendApi {
    fn submit(&mut self, report: &CapturedReport) -> Result<Submission>;
}

/// Posts reports as JSON over HTTPS, authenticated with an access token.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    settings: ApiSettings,
}
impl HttpBackend {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProvisionError::SubmissionError(format!("HTTP client: {}", e)))?;
        Ok(HttpBackend { client, settings })
    }
}
impl BackendApi for HttpBackend {
    fn submit(&mut self, report: &CapturedReport) -> Result<Submission> {
        let url = self
            .settings
            .url
            .as_deref()
            .ok_or_else(|| ProvisionError::SubmissionError("no backend URL configured".into()))?;

        let body = SaveTests {
            test: report.to_value(),
            batch_number: &self.settings.batch_number,
        };
        debug!("POST {}", url);
        let resp = self
            .client
            .post(url)
            .header("x-access-token", &self.settings.token)
            .json(&body)
            .send()
            .map_err(|e| ProvisionError::SubmissionError(format!("network: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(ProvisionError::SubmissionError(format!(
                "HTTP {}: {}",
                status, text
            )));
        }
        info!("Report saved by the backend ({})", status);

        let data: Value = resp
            .json()
            .map_err(|e| ProvisionError::SubmissionError(format!("decode: {}", e)))?;
        Ok(submission_from(&data, &self.settings.link_field))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Serialize)]
struct SaveTests<'a> {
    test: Value,
    batch_number: &'a str,
}

fn submission_from(data: &Value, link_field: &str) -> Submission {
    let link = data
        .get(link_field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    Submission { link }
}

// =============================================================================
// Unit Tests
// =============================================================================
