use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use uuid::Uuid;

use super::types::{BatchRequest, BatchResponse, FileRequest, FileResult};
use super::{Authorization, AuthorizationIssuer, Resolution};
use crate::error::TransferError;
use crate::state_machine::FileCandidate;

const BATCH_PATH: &str = "/api/upload/presigned-batch";

/// Lifetime assumed when the issuer omits an expiry.
fn default_ttl() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// Issues write authorizations through the backend's batch presign endpoint.
pub struct HttpIssuer {
    client: Client,
    endpoint: String,
}

impl HttpIssuer {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{BATCH_PATH}", base_url.trim_end_matches('/')),
        }
    }

    async fn post_batch(
        &self,
        candidates: &[FileCandidate],
    ) -> Result<HashMap<String, Resolution>, TransferError> {
        let request_id = Uuid::new_v4().to_string();
        let body = BatchRequest {
            files: candidates
                .iter()
                .map(|c| FileRequest {
                    filename: c.identity.clone(),
                    file_size: c.size,
                })
                .collect(),
        };
        tracing::debug!(request_id = %request_id, files = body.files.len(), "requesting write authorizations");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Request-ID", &request_id)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_status(status, message));
        }

        let parsed = response.json::<BatchResponse>().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|(name, result)| (name, to_resolution(result)))
            .collect())
    }
}

impl AuthorizationIssuer for HttpIssuer {
    async fn issue_batch(
        &self,
        candidates: &[FileCandidate],
    ) -> Result<HashMap<String, Resolution>, TransferError> {
        self.post_batch(candidates).await
    }
}

fn classify_status(status: StatusCode, message: String) -> TransferError {
    let detail = format!("issuer returned {}: {message}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransferError::Transient(detail)
    } else {
        TransferError::PermanentValidation(detail)
    }
}

fn to_resolution(result: FileResult) -> Resolution {
    if result.is_duplicate {
        return Resolution::Duplicate;
    }
    if result.error {
        let message = result
            .message
            .unwrap_or_else(|| "issuer could not authorize file".to_string());
        return Resolution::Failed(TransferError::Transient(message));
    }
    let Some(url) = result.upload_url else {
        return Resolution::Failed(TransferError::Transient(
            "issuer response missing upload URL".to_string(),
        ));
    };
    let expires_at = result
        .expires
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(|| Utc::now() + default_ttl());
    Resolution::Authorized(Authorization {
        url,
        expires_at,
        large_file: result.is_large_file.unwrap_or(false),
    })
}
