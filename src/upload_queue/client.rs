//! HTTP client for the catalog ingestion endpoints.
//!
//! Provides the archive upload (multipart, with byte-level progress) and the
//! job status query used by the status poller.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::error::TransferError;
use super::models::{ArchiveSource, JobOptions};

/// Size of the chunks an in-memory archive is streamed in.
const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

/// Multipart field names owned by the upload request itself.
const RESERVED_FIELDS: [&str; 3] = ["file", "display_name", "destination"];

type ChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// Byte counts reported while an archive is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

/// Everything the upload endpoint needs for one archive.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub display_name: String,
    pub options: JobOptions,
    pub destination: Option<String>,
    pub source: ArchiveSource,
}

/// Body returned by the upload endpoint once it accepted an archive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadAccepted {
    #[serde(alias = "serverJobId")]
    pub job_id: String,
    #[serde(alias = "unitsTotal")]
    pub units_total: u32,
}

/// Server-side processing state of an accepted archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerJobState {
    Processing,
    Completed,
    Failed,
}

/// Body returned by the job status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobStatusReport {
    pub state: ServerJobState,
    #[serde(default, alias = "progressPercent")]
    pub progress_percent: i64,
    #[serde(default, alias = "unitsProcessed")]
    pub units_processed: u32,
    #[serde(default, alias = "unitsTotal")]
    pub units_total: u32,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: Option<String>,
}

/// The two endpoints the upload queue talks to.
#[async_trait]
pub trait IngestionApi: Send + Sync {
    /// Send one archive. Byte counts are pushed to `progress` as the body is streamed.
    async fn upload_archive(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<UploadAccepted, TransferError>;

    /// Fetch the current processing status of an accepted archive.
    async fn job_status(&self, server_job_id: &str) -> Result<JobStatusReport>;
}

/// reqwest-backed implementation of [`IngestionApi`].
#[derive(Clone)]
pub struct HttpIngestionClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    status_timeout: Duration,
}

impl HttpIngestionClient {
    /// Create a new ingestion client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the catalog API (e.g., "https://pool.example.com/api")
    /// * `auth_token` - Bearer credential, if the endpoints require one
    /// * `connect_timeout_secs` - Connection timeout for every request
    /// * `status_timeout_secs` - Total timeout for a single status request
    ///
    /// Uploads have no total timeout: a large archive takes as long as it takes.
    pub fn new(
        base_url: String,
        auth_token: Option<String>,
        connect_timeout_secs: u64,
        status_timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .build()?;

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            auth_token,
            status_timeout: Duration::from_secs(status_timeout_secs),
        })
    }

    /// Get the base URL of the catalog API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn upload_url(&self) -> String {
        format!("{}/v1/ingestion/upload", self.base_url)
    }

    fn status_url(&self, server_job_id: &str) -> String {
        format!("{}/v1/ingestion/job/{}", self.base_url, server_job_id)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Open the archive as a chunk stream along with its total size.
    async fn open_archive(source: &ArchiveSource) -> Result<(ChunkStream, u64), TransferError> {
        match source {
            ArchiveSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let total = file.metadata().await?.len();
                Ok((Box::pin(ReaderStream::new(file)), total))
            }
            ArchiveSource::Memory { data, .. } => {
                let total = data.len() as u64;
                let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
                    .step_by(MEMORY_CHUNK_SIZE)
                    .map(|start| Ok(data.slice(start..(start + MEMORY_CHUNK_SIZE).min(data.len()))))
                    .collect();
                Ok((Box::pin(futures::stream::iter(chunks)), total))
            }
        }
    }

    async fn archive_part(
        source: &ArchiveSource,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<Part, TransferError> {
        let (stream, total) = Self::open_archive(source).await?;

        let mut sent = 0u64;
        let counted = stream.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                // The receiver may be gone if the driver stopped listening
                let _ = progress.send(TransferProgress {
                    bytes_sent: sent,
                    bytes_total: total,
                });
            }
            chunk
        });

        let file_name = source.file_name();
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(counted), total)
            .file_name(file_name.clone())
            .mime_str(archive_mime_type(&file_name))?;
        Ok(part)
    }
}

fn archive_mime_type(file_name: &str) -> &'static str {
    if file_name.to_ascii_lowercase().ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}

/// Message to show the operator when the upload endpoint refused an archive.
fn rejection_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("Upload failed with status {}", status))
}

#[async_trait]
impl IngestionApi for HttpIngestionClient {
    async fn upload_archive(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<UploadAccepted, TransferError> {
        let mut form = Form::new().text("display_name", request.display_name.clone());
        if let Some(destination) = &request.destination {
            form = form.text("destination", destination.clone());
        }
        for (key, value) in &request.options {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                warn!("Skipping option {:?}: the field name is reserved", key);
                continue;
            }
            form = form.text(key.clone(), value.clone());
        }
        form = form.part("file", Self::archive_part(&request.source, progress).await?);

        debug!("Uploading {:?} to {}", request.display_name, self.upload_url());
        let response = self
            .authorize(self.client.post(self.upload_url()))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                message: rejection_message(status, &body),
            });
        }

        let accepted: UploadAccepted = serde_json::from_str(&body)
            .map_err(|e| TransferError::MalformedResponse(e.to_string()))?;
        if accepted.job_id.trim().is_empty() {
            return Err(TransferError::MalformedResponse(
                "empty job id".to_string(),
            ));
        }

        Ok(accepted)
    }

    async fn job_status(&self, server_job_id: &str) -> Result<JobStatusReport> {
        let response = self
            .authorize(self.client.get(self.status_url(server_job_id)))
            .timeout(self.status_timeout)
            .send()
            .await
            .context("Failed to reach job status endpoint")?;

        if !response.status().is_success() {
            bail!(
                "Job status request for {} failed with status: {}",
                server_job_id,
                response.status()
            );
        }

        response
            .json()
            .await
            .context("Failed to parse job status response")
    }
}
