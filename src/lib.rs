//! gridlink — async client for the GridLink remote job-execution service.
//!
//! Establishes and maintains an authenticated session, submits compute jobs
//! with file attachments, polls their status, and downloads result
//! artifacts. Credentials rotate in the background for as long as the
//! session is open.
//!
//! # Quick Start
//!
//! ```no_run
//! use gridlink::{CredentialSource, GridConnection, JobRequest, JobService, PollPolicy};
//!
//! # async fn example() -> gridlink::Result<()> {
//! let mut conn = GridConnection::new();
//! conn.connect(CredentialSource::Token("my-refresh-token".into())).await?;
//!
//! let job = JobRequest::new("vm-large", "my-job", "demo", 300)
//!     .with_file("circuit.bin");
//! let id = conn.submit_job(job).await?;
//!
//! conn.wait_for_completion(&id, &PollPolicy::long_running()).await?;
//! let files = conn.download_results(&id, None).await?;
//! println!("downloaded: {files:?}");
//!
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod poll;
pub mod types;

pub use client::{
    Attachment, CredentialSource, FileSource, GatewayConnection, GridConnection, JobRequest,
    JobService,
};
pub use error::{LinkError, Result};
pub use poll::PollPolicy;
pub use types::{ExecutionStatus, JwtToken, RequestInfo, UserLimits};
