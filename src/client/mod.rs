//! Connection types and the shared job-service interface.

pub mod gateway;
pub mod grid;
pub mod service;

pub use gateway::GatewayConnection;
pub use grid::{CredentialSource, GridConnection};
pub use service::{Attachment, FileSource, JobRequest, JobService};

use std::time::Duration;

/// Build the per-connection HTTP client: a short connect timeout so a dead
/// server is detected quickly, and no global request timeout (short-lived
/// calls set one per request; uploads and downloads run unbounded).
pub(crate) fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}
