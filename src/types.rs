//! Wire types for the job-execution API.

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution request on the server.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Running,
    Done,
    Error,
    Canceled,
}

impl ExecutionStatus {
    /// Whether the execution has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }
}

/// Server-owned record of a submitted execution request.
///
/// The client never mutates this; it is a projection of server state fetched
/// on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub user: Option<RequestUser>,
    /// Epoch milliseconds.
    #[serde(rename = "creationDate", default)]
    pub creation_date: Option<i64>,
    #[serde(rename = "runningDate", default)]
    pub running_date: Option<i64>,
    #[serde(rename = "doneDate", default)]
    pub done_date: Option<i64>,
    #[serde(rename = "numberOfUploadedFiles", default)]
    pub uploaded_files: u32,
    #[serde(rename = "numberOfResultedFiles", default)]
    pub result_files: u32,
}

impl RequestInfo {
    pub fn user_email(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.email.as_deref())
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request {} | Name: {} | Label: {} | Status: {}",
            self.id, self.name, self.label, self.status
        )?;
        if let Some(created) = self.creation_date.map(format_epoch_millis) {
            write!(f, " | Created: {created}")?;
        }
        if self.uploaded_files > 0 || self.result_files > 0 {
            write!(
                f,
                " | Files: {}/{} (up/res)",
                self.uploaded_files, self.result_files
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestUser {
    #[serde(default)]
    pub email: Option<String>,
}

/// Count executions in a listing by status.
pub fn status_counts(infos: &[RequestInfo]) -> BTreeMap<ExecutionStatus, usize> {
    let mut counts = BTreeMap::new();
    for info in infos {
        *counts.entry(info.status).or_insert(0) += 1;
    }
    counts
}

/// Wire wrapper for `GET /request` listings: `{executions: {docs: [...]}}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    pub executions: ExecutionPage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecutionPage {
    pub docs: Vec<RequestInfo>,
}

/// Per-user quota snapshot from `GET /users/limits`.
///
/// All fields are optional; the server omits whatever is not configured for
/// the account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLimits {
    #[serde(default)]
    pub enabled_execution_time: Option<bool>,
    #[serde(default)]
    pub used_execution_time: Option<f64>,
    #[serde(default)]
    pub max_execution_time: Option<f64>,
    #[serde(default)]
    pub enabled_max_executions: Option<bool>,
    #[serde(default)]
    pub used_executions: Option<u64>,
    #[serde(default)]
    pub max_executions: Option<u64>,
    #[serde(default)]
    pub enabled_max_timeout: Option<bool>,
    #[serde(default)]
    pub max_timeout: Option<f64>,
}

impl UserLimits {
    /// Messages for every quota the user has exceeded.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.enabled_execution_time == Some(true) {
            if let (Some(used), Some(max)) = (self.used_execution_time, self.max_execution_time) {
                if used > max {
                    out.push(format!(
                        "computing time limit of {} minutes exceeded",
                        (max / 60.0).round()
                    ));
                }
            }
        }
        if self.enabled_max_executions == Some(true) {
            if let (Some(used), Some(max)) = (self.used_executions, self.max_executions) {
                if used > max {
                    out.push(format!("execution count limit of {max} exceeded"));
                }
            }
        }
        out
    }
}

/// Durable token file contents: the sole persisted session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    /// The long-lived refresh token.
    pub token: String,
    /// Base URL the token was issued against.
    pub url: String,
}

/// JWT-style token returned by the gateway token endpoint.
///
/// Replaced wholesale on each renewal, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtToken {
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
}

fn format_epoch_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}
