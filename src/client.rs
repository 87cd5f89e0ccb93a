use std::time::Duration;

use uuid::Uuid;

use crate::api::{ErrorResponse, SubmitRequest, SubmitResponse};
use crate::error::{JudgeError, Result};
use crate::service::JobView;

/// HTTP client for a running judge.
#[derive(Debug, Clone)]
pub struct JudgeClient {
    http: reqwest::Client,
    base_url: String,
}

impl JudgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn submit(&self, code: &str, expected_output: &str) -> Result<Uuid> {
        let response = self
            .http
            .post(format!("{}/submit", self.base_url))
            .json(&SubmitRequest {
                code: code.to_string(),
                expected_output: expected_output.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json::<SubmitResponse>().await?.job_id)
    }

    pub async fn status(&self, job_id: &Uuid) -> Result<JobView> {
        let response = self
            .http
            .get(format!("{}/status/{}", self.base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json::<JobView>().await?)
    }

    /// Poll `/status` until the job is terminal or `timeout` elapses.
    pub async fn wait_for(&self, job_id: &Uuid, poll_interval: Duration, timeout: Duration) -> Result<JobView> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.status(job_id).await?;
            if view.is_terminal() {
                return Ok(view);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(JudgeError::Internal(format!(
                    "job {} still {} after {:?}",
                    job_id, view.status, timeout
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

async fn api_error(response: reqwest::Response) -> JudgeError {
    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(body) => serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body),
        Err(e) => e.to_string(),
    };
    JudgeError::Api { status, message }
}
