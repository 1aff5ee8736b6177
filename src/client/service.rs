//! Shared job-submission and transfer operations.
//!
//! [`JobService`] is the capability seam implemented by both connection
//! types: the accessors are required, every job operation is a provided
//! method built on top of them.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::{LinkError, Result};
use crate::poll::PollPolicy;
use crate::types::{ExecutionStatus, ListResponse, RequestInfo};

/// Timeout applied to short-lived calls. Uploads and downloads deliberately
/// opt out: payloads may be large and slow.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which file set of an execution request to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    Uploads,
    Results,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploads => "uploads",
            Self::Results => "results",
        }
    }
}

/// One file attached to a job submission.
#[derive(Debug, Clone)]
pub enum Attachment {
    /// A file on disk, streamed during upload.
    Path(PathBuf),
    /// An in-memory payload with an explicit file name.
    Bytes { filename: String, data: Vec<u8> },
}

impl Attachment {
    async fn into_part(self) -> Result<Part> {
        match self {
            Self::Path(path) => {
                let filename = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| {
                        LinkError::InvalidArgument(format!(
                            "attachment path has no file name: {}",
                            path.display()
                        ))
                    })?
                    .to_string();
                let file = tokio::fs::File::open(&path).await?;
                let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
                Ok(Part::stream(body).file_name(filename))
            }
            Self::Bytes { filename, data } => Ok(Part::bytes(data).file_name(filename)),
        }
    }
}

/// A compute job to submit.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Executor kind requested from the server (the `emulatorType` field).
    pub executor: String,
    pub name: String,
    pub label: String,
    /// Server-side execution time limit, in seconds.
    pub timeout_secs: u64,
    pub attachments: Vec<Attachment>,
}

impl JobRequest {
    pub fn new(
        executor: impl Into<String>,
        name: impl Into<String>,
        label: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            executor: executor.into(),
            name: name.into(),
            label: label.into(),
            timeout_secs,
            attachments: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(Attachment::Path(path.into()));
        self
    }

    pub fn with_bytes(mut self, filename: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.push(Attachment::Bytes {
            filename: filename.into(),
            data,
        });
        self
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "executionRequestId")]
    execution_request_id: String,
}

/// Authenticated operations against the job-execution API, shared by every
/// connection type.
#[async_trait]
pub trait JobService: Send + Sync {
    /// The connection's HTTP client.
    fn http(&self) -> &reqwest::Client;

    /// Absolute URL for an API path (no leading slash).
    fn api_url(&self, path: &str) -> String;

    /// `Authorization` header value for the current credentials, or
    /// [`LinkError::NotAuthenticated`] when no successful connect happened.
    fn auth_header(&self) -> Result<String>;

    /// Fail fast when the session holds no credentials. Called at the top of
    /// every authenticated operation so "not connected" is always reported
    /// precisely rather than surfacing as a 401 deep in a transport call.
    fn check_auth(&self) -> Result<()> {
        self.auth_header().map(|_| ())
    }

    /// Submit a job and return the server-assigned execution id.
    async fn submit_job(&self, job: JobRequest) -> Result<String> {
        let auth = self.auth_header()?;
        let mut form = Form::new()
            .text("name", job.name)
            .text("label", job.label)
            .text("emulatorType", job.executor)
            .text("timeout", job.timeout_secs.to_string());
        for attachment in job.attachments {
            form = form.part("uploads", attachment.into_part().await?);
        }
        // No client-side timeout: uploads may be large and slow.
        let response = self
            .http()
            .post(self.api_url("request"))
            .header(AUTHORIZATION, &auth)
            .multipart(form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(LinkError::upload(status, server_message(response).await));
        }
        let payload: SubmitResponse = response.json().await?;
        Ok(payload.execution_request_id)
    }

    /// Fetch the current server-side record of an execution request.
    async fn request_info(&self, id: &str) -> Result<RequestInfo> {
        let auth = self.auth_header()?;
        let response = self
            .http()
            .get(self.api_url(&format!("request/{id}")))
            .header(AUTHORIZATION, &auth)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(LinkError::request(status, server_message(response).await));
        }
        Ok(response.json().await?)
    }

    /// List execution requests, optionally narrowed by key/value filters
    /// passed through as query-string parameters.
    async fn list_requests(&self, filters: &[(&str, &str)]) -> Result<Vec<RequestInfo>> {
        let auth = self.auth_header()?;
        let response = self
            .http()
            .get(self.api_url("request"))
            .query(filters)
            .header(AUTHORIZATION, &auth)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(LinkError::request(status, server_message(response).await));
        }
        let payload: ListResponse = response.json().await?;
        Ok(payload.executions.docs)
    }

    /// Ask the server to stop a running execution.
    async fn stop_execution(&self, id: &str) -> Result<()> {
        self.empty_post(&format!("stop-execution/{id}")).await
    }

    /// Ask the server to delete the files of an execution request.
    async fn delete_files(&self, id: &str) -> Result<()> {
        self.empty_post(&format!("delete-files/{id}")).await
    }

    #[doc(hidden)]
    async fn empty_post(&self, path: &str) -> Result<()> {
        let auth = self.auth_header()?;
        let response = self
            .http()
            .post(self.api_url(path))
            .header(AUTHORIZATION, &auth)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(LinkError::request(status, server_message(response).await));
        }
        Ok(())
    }

    /// Download one file of an execution request into `dest_dir`, returning
    /// the server-provided file name.
    async fn download_file(
        &self,
        id: &str,
        index: u32,
        source: FileSource,
        dest_dir: &Path,
    ) -> Result<String> {
        self.download_file_with_policy(id, index, source, dest_dir, &PollPolicy::default())
            .await
    }

    /// Like [`JobService::download_file`], with an explicit retry schedule
    /// for the HTTP 202 "result not ready yet" signal.
    async fn download_file_with_policy(
        &self,
        id: &str,
        index: u32,
        source: FileSource,
        dest_dir: &Path,
        policy: &PollPolicy,
    ) -> Result<String> {
        let auth = self.auth_header()?;
        let url = self.api_url(&format!("files/{id}/{index}"));

        let mut delays = policy.delays();
        let response = loop {
            // No client-side timeout: result files may be large.
            let response = self
                .http()
                .get(&url)
                .query(&[("source", source.as_str())])
                .header(AUTHORIZATION, &auth)
                .send()
                .await?;
            match response.status() {
                StatusCode::OK => break response,
                StatusCode::ACCEPTED => match delays.next() {
                    Some(delay) => {
                        tracing::info!(
                            id,
                            index,
                            delay_secs = delay.as_secs(),
                            "server is still preparing the file; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(LinkError::Timeout(format!(
                            "file {index} of request {id} was still pending after {} attempts",
                            policy.max_attempts
                        )));
                    }
                },
                status => {
                    return Err(LinkError::request(
                        status.as_u16(),
                        server_message(response).await,
                    ));
                }
            }
        };

        // A missing filename is a server defect; never worked around here.
        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_filename)
            .ok_or_else(|| {
                LinkError::Protocol(format!(
                    "response for file {index} of request {id} carries no filename"
                ))
            })?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let body = response.bytes().await?;
        tokio::fs::write(dest_dir.join(&filename), &body).await?;
        Ok(filename)
    }

    /// Download every file of the given kind, sequentially and in index
    /// order. The first failed download aborts the remainder.
    async fn download_files(
        &self,
        id: &str,
        source: FileSource,
        dest_dir: Option<&Path>,
    ) -> Result<Vec<String>> {
        self.check_auth()?;
        let default_dir = PathBuf::from(id);
        let dest_dir = dest_dir.unwrap_or(&default_dir);

        let info = self.request_info(id).await?;
        let count = match source {
            FileSource::Uploads => info.uploaded_files,
            FileSource::Results => info.result_files,
        };

        let mut names = Vec::with_capacity(count as usize);
        for index in 0..count {
            names.push(self.download_file(id, index, source, dest_dir).await?);
        }
        Ok(names)
    }

    /// Download the input files of an execution request.
    async fn download_inputs(&self, id: &str, dest_dir: Option<&Path>) -> Result<Vec<String>> {
        self.download_files(id, FileSource::Uploads, dest_dir).await
    }

    /// Download the result files of an execution request.
    async fn download_results(&self, id: &str, dest_dir: Option<&Path>) -> Result<Vec<String>> {
        self.download_files(id, FileSource::Results, dest_dir).await
    }

    /// Whether the execution reached DONE or ERROR. Re-fetches on every call.
    async fn is_done(&self, id: &str) -> Result<bool> {
        let status = self.request_info(id).await?.status;
        Ok(matches!(
            status,
            ExecutionStatus::Done | ExecutionStatus::Error
        ))
    }

    /// Whether the execution failed. Re-fetches on every call.
    async fn is_failed(&self, id: &str) -> Result<bool> {
        Ok(self.request_info(id).await?.status == ExecutionStatus::Error)
    }

    /// Whether the execution left the NEW state. Re-fetches on every call.
    async fn is_started(&self, id: &str) -> Result<bool> {
        Ok(self.request_info(id).await?.status != ExecutionStatus::New)
    }

    /// Whether the execution was canceled. Re-fetches on every call.
    async fn is_canceled(&self, id: &str) -> Result<bool> {
        Ok(self.request_info(id).await?.status == ExecutionStatus::Canceled)
    }

    /// Poll until the execution reaches a terminal status, backing off per
    /// `policy`. Errors with [`LinkError::Timeout`] when attempts run out.
    async fn wait_for_completion(&self, id: &str, policy: &PollPolicy) -> Result<RequestInfo> {
        let info = self.request_info(id).await?;
        if info.status.is_terminal() {
            return Ok(info);
        }
        for delay in policy.delays() {
            tokio::time::sleep(delay).await;
            let info = self.request_info(id).await?;
            if info.status.is_terminal() {
                return Ok(info);
            }
        }
        Err(LinkError::Timeout(format!(
            "request {id} did not finish within {} polls",
            policy.max_attempts
        )))
    }
}

/// Best-effort extraction of the server's error message: the JSON `message`
/// field when present, the raw body otherwise.
pub(crate) async fn server_message(response: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.message,
        Err(_) if text.is_empty() => "Unknown error".to_string(),
        Err(_) => text,
    }
}

fn extract_filename(disposition: &str) -> Option<String> {
    static FILENAME: OnceLock<Regex> = OnceLock::new();
    let re = FILENAME.get_or_init(|| {
        Regex::new(r#"filename="([^"]+)""#).expect("filename pattern is valid")
    });
    re.captures(disposition)
        .map(|caps| caps[1].to_string())
}
