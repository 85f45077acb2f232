//! Moving file bytes to an authorized URL.
//!
//! The [`Transport`] trait is the seam between the queue and whatever carries
//! the bytes. [`HttpTransport`] streams the file in a single PUT and reports
//! a running byte count as chunks leave.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, StatusCode};
use tokio_util::io::ReaderStream;

use crate::error::TransferError;
use crate::resolver::Authorization;

/// Receives the cumulative number of bytes sent. Values never decrease.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// One transfer attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub identity: &'a str,
    pub source: &'a Path,
    pub size: u64,
    pub authorization: &'a Authorization,
}

pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransferRequest<'_>,
        progress: ProgressFn,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        // No overall timeout: large files on slow links legitimately take long.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransferRequest<'_>,
        progress: ProgressFn,
    ) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(request.source)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    TransferError::PermanentValidation(format!(
                        "cannot read {}: {err}",
                        request.source.display()
                    ))
                }
                _ => TransferError::from(err),
            })?;

        let mut sent: u64 = 0;
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent);
        });

        let response = self
            .client
            .put(&request.authorization.url)
            .header(CONTENT_LENGTH, request.size)
            .body(Body::wrap_stream(stream))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(identity = request.identity, bytes = request.size, "transfer complete");
            return Ok(());
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(classify_status(status, message))
    }
}

fn classify_status(status: StatusCode, message: String) -> TransferError {
    if status == StatusCode::FORBIDDEN {
        // Presigned URLs answer 403 once their signature window has passed.
        return TransferError::AuthorizationExpired;
    }
    let detail = format!("store returned {}: {message}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransferError::Transient(detail)
    } else {
        TransferError::PermanentValidation(detail)
    }
}
