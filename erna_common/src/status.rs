//! Status reports sent from node executors to the job monitor.
//!
//! Every report is a single `POST /status` carrying a JSON [`StatusReport`].
//! The monitor answers with the JSON value `true` once the report has been
//! stored, and executors wait for that answer before they carry on.

use async_trait::async_trait;
use std::time::Duration;

use crate::prelude::*;

/// The path the monitor accepts reports on.
pub const STATUS_PATH: &str = "/status";

/// One status change of one job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusReport {
    /// The job whose status changed.
    pub job_id: i32,
    /// The new status.
    pub status: ProcessingState,
    /// Where the output was stored. Only sent with `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    /// The MD5 checksum of the output. Only sent with `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StatusReport {
    /// A report without result fields.
    pub fn new(job_id: i32, status: ProcessingState) -> Self {
        StatusReport {
            job_id,
            status,
            result_path: None,
            checksum: None,
        }
    }

    /// A report announcing that `job_id` produced `result_path`.
    pub fn success(job_id: i32, result_path: String, checksum: String) -> Self {
        StatusReport {
            job_id,
            status: ProcessingState::Success,
            result_path: Some(result_path),
            checksum: Some(checksum),
        }
    }

    /// Check that the result fields are present exactly when they should be.
    pub fn validate(&self) -> Result<()> {
        if self.status == ProcessingState::Success {
            if self.result_path.as_deref().map_or(true, str::is_empty) {
                return Err(format_err!(
                    "success report for job {} has no result path",
                    self.job_id
                ));
            }
            match &self.checksum {
                Some(checksum) if is_md5_hex(checksum) => {}
                Some(checksum) => {
                    return Err(format_err!(
                        "success report for job {} has malformed checksum {:?}",
                        self.job_id,
                        checksum,
                    ))
                }
                None => {
                    return Err(format_err!(
                        "success report for job {} has no checksum",
                        self.job_id
                    ))
                }
            }
        } else if self.result_path.is_some() || self.checksum.is_some() {
            return Err(format_err!(
                "{} report for job {} must not carry a result",
                self.status,
                self.job_id,
            ));
        }
        if self.status == ProcessingState::Inserted {
            return Err(format_err!("executors cannot report {}", self.status));
        }
        Ok(())
    }
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Something that delivers status reports and waits for them to be
/// acknowledged.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Deliver `report`. Returns once the report has been acknowledged.
    async fn report(&self, report: &StatusReport) -> Result<()>;
}

/// Delivers status reports to a job monitor over HTTP.
#[derive(Clone, Debug)]
pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpReporter {
    /// Report to the monitor listening on `host` and `port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("could not build HTTP client")?;
        Ok(HttpReporter {
            client,
            url: format!("http://{}:{}{}", host, port, STATUS_PATH),
        })
    }
}

#[async_trait]
impl StatusReporter for HttpReporter {
    #[instrument(skip(self), fields(url = %self.url), level = "debug")]
    async fn report(&self, report: &StatusReport) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .with_context(|| format!("could not send status report to {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format_err!(
                "monitor rejected {} report for job {} with {}: {}",
                report.status,
                report.job_id,
                status,
                body.trim(),
            ));
        }
        let ack = resp
            .json::<bool>()
            .await
            .context("could not parse acknowledgement from monitor")?;
        if !ack {
            return Err(format_err!("monitor did not acknowledge report for job {}", report.job_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn success_needs_a_result() {
        assert!(StatusReport::success(1, "/out/x.fits".to_owned(), CHECKSUM.to_owned())
            .validate()
            .is_ok());
        assert!(StatusReport::new(1, ProcessingState::Success).validate().is_err());
        assert!(StatusReport::success(1, "/out/x.fits".to_owned(), "D41D8CD9".to_owned())
            .validate()
            .is_err());
        assert!(StatusReport::success(1, String::new(), CHECKSUM.to_owned())
            .validate()
            .is_err());
    }

    #[test]
    fn other_reports_carry_no_result() {
        assert!(StatusReport::new(1, ProcessingState::Running).validate().is_ok());
        let mut report = StatusReport::new(1, ProcessingState::Failed);
        report.checksum = Some(CHECKSUM.to_owned());
        assert!(report.validate().is_err());
        assert!(StatusReport::new(1, ProcessingState::Inserted).validate().is_err());
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_value(StatusReport::new(7, ProcessingState::Running)).unwrap();
        assert_eq!(json, serde_json::json!({ "job_id": 7, "status": "running" }));

        let report: StatusReport = serde_json::from_str(&format!(
            r#"{{"job_id": 7, "status": "success", "result_path": "/out/x.fits", "checksum": "{}"}}"#,
            CHECKSUM,
        ))
        .unwrap();
        assert_eq!(report, StatusReport::success(7, "/out/x.fits".to_owned(), CHECKSUM.to_owned()));
    }
}
