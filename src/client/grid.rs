//! Session manager for the GridLink cloud service.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::login_server;
use crate::auth::token_file;
use crate::auth::{CredentialPair, CredentialStore, Refresher};
use crate::client::build_http_client;
use crate::client::service::{server_message, JobService, REQUEST_TIMEOUT};
use crate::error::{LinkError, Result};
use crate::types::UserLimits;

/// Default production endpoint.
pub const DEFAULT_CLOUD_URL: &str = "https://cloud.gridlink.io";

/// Fixed port tried first for the browser login page.
const PREFERRED_LOGIN_PORT: u16 = 1444;

/// Access tokens rotate well before their lifetime at this cadence.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How a session obtains its initial credentials.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Interactive login through a locally served browser page.
    Browser,
    /// A previously issued refresh token.
    Token(String),
    /// Email and password.
    Password { email: String, password: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct SignInPayload {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TokenPairResponse {
    token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

/// Outcome of one sign-in attempt, mirrored verbatim to the login page so it
/// can render success or the server's own error message.
struct SignInOutcome {
    status: u16,
    body: String,
}

/// Authenticated session against the GridLink remote services.
///
/// One `GridConnection` owns its credential store and, while open, exactly
/// one background [`Refresher`] that is the sole writer of new tokens.
///
/// # Example
/// ```no_run
/// use gridlink::{GridConnection, CredentialSource};
///
/// # async fn example() -> gridlink::Result<()> {
/// let mut conn = GridConnection::new();
/// conn.connect(CredentialSource::Token("my-refresh-token".into())).await?;
/// assert!(conn.is_open());
/// conn.close().await;
/// # Ok(())
/// # }
/// ```
pub struct GridConnection {
    base_url: String,
    client: reqwest::Client,
    store: Arc<CredentialStore>,
    refresher: Option<Refresher>,
    refresher_interval: Duration,
    user_limits: Arc<Mutex<Option<UserLimits>>>,
    preferred_login_port: u16,
    open_browser: bool,
}

impl GridConnection {
    /// Connection against the default cloud endpoint.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_CLOUD_URL)
    }

    /// Connection against a specific deployment.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            base_url: url.into(),
            client: build_http_client(),
            store: Arc::new(CredentialStore::new()),
            refresher: None,
            refresher_interval: DEFAULT_REFRESH_INTERVAL,
            user_limits: Arc::new(Mutex::new(None)),
            preferred_login_port: PREFERRED_LOGIN_PORT,
            open_browser: true,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresher_interval = interval;
        self
    }

    pub fn with_preferred_login_port(mut self, port: u16) -> Self {
        self.preferred_login_port = port;
        self
    }

    /// Disable launching the default browser during the interactive flow;
    /// the login URL is still logged.
    pub fn with_browser_launch(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of the current credential pair, e.g. for persisting.
    pub fn credentials(&self) -> Option<CredentialPair> {
        self.store.get()
    }

    /// Latest user-quota snapshot fetched from the server.
    pub fn user_limits(&self) -> Option<UserLimits> {
        self.user_limits
            .lock()
            .expect("limits lock poisoned")
            .clone()
    }

    /// Connect with the given credential source. A no-op when the session is
    /// already open.
    pub async fn connect(&mut self, source: CredentialSource) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        match source {
            CredentialSource::Browser => self.connect_with_browser().await,
            CredentialSource::Token(token) => self.connect_with_token(&token).await,
            CredentialSource::Password { email, password } => {
                self.connect_with_password(&email, &password).await
            }
        }
    }

    /// Authenticate with email and password.
    pub async fn connect_with_password(&mut self, email: &str, password: &str) -> Result<()> {
        if self.is_open() {
            self.close().await;
        }
        let payload = SignInPayload {
            email: email.to_string(),
            password: password.to_string(),
        };
        let outcome = self.sign_in(&payload).await?;
        if outcome.status != 200 {
            let reason = error_message(&outcome.body);
            return Err(LinkError::Authentication(format!(
                "sign-in rejected with status {}: {reason}",
                outcome.status
            )));
        }
        Ok(())
    }

    /// Authenticate with a previously issued refresh token.
    pub async fn connect_with_token(&mut self, refresh_token: &str) -> Result<()> {
        if self.is_open() {
            self.close().await;
        }
        let pair = refresh_credentials(&self.client, &self.api_url("access-token"), refresh_token)
            .await
            .map_err(|err| LinkError::Authentication(format!("token connect failed: {err}")))?;
        self.store.set(pair);
        tracing::info!("authentication successful");
        self.update_user_limits().await?;
        self.start_refresher().await;
        Ok(())
    }

    /// Authenticate by serving a local login page and opening the default
    /// browser on it.
    ///
    /// Blocks the calling task, handling one request at a time, until the
    /// login page completes a successful sign-in.
    pub async fn connect_with_browser(&mut self) -> Result<()> {
        if self.is_open() {
            self.close().await;
        }

        // Preferred fixed port first, ephemeral fallback when occupied.
        let listener = match TcpListener::bind(("127.0.0.1", self.preferred_login_port)).await {
            Ok(listener) => listener,
            Err(_) => TcpListener::bind(("127.0.0.1", 0)).await?,
        };
        let port = listener.local_addr()?.port();
        let login_url = format!("http://localhost:{port}");
        tracing::info!(%login_url, "waiting for browser login");

        if self.open_browser {
            if let Err(err) = open::that(&login_url) {
                tracing::warn!(error = %err, %login_url, "could not launch a browser; open the login URL manually");
            }
        }

        while self.store.access_token().is_none() {
            let (mut stream, _) = listener.accept().await?;
            if let Err(err) = self.handle_login_request(&mut stream).await {
                tracing::warn!(error = %err, "login request failed");
            }
        }
        Ok(())
    }

    /// Restore a session from a token file written by [`Self::save_token`].
    pub async fn load_token(&mut self, path: &Path) -> Result<()> {
        let file = token_file::load(path, &self.base_url)?;
        self.connect_with_token(&file.token).await
    }

    /// Persist the refresh token and base URL, the sole durable session
    /// state.
    pub fn save_token(&self, path: &Path) -> Result<()> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or(LinkError::NotAuthenticated)?;
        token_file::save(path, &refresh_token, &self.base_url)
    }

    /// Exchange the current refresh token for a fresh credential pair.
    pub async fn refresh(&self) -> Result<()> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or(LinkError::NotAuthenticated)?;
        let pair =
            refresh_credentials(&self.client, &self.api_url("access-token"), &refresh_token)
                .await?;
        self.store.set(pair);
        Ok(())
    }

    /// Stop the refresher and drop both tokens. Idempotent.
    pub async fn close(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            tracing::info!(url = %self.base_url, "closing connection");
            refresher.shutdown().await;
        }
        self.store.clear();
        *self.user_limits.lock().expect("limits lock poisoned") = None;
    }

    /// True iff the refresher task is alive and an access credential is
    /// present.
    pub fn is_open(&self) -> bool {
        self.refresher.as_ref().is_some_and(Refresher::is_alive)
            && self.store.access_token().is_some()
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST the credentials to the sign-in endpoint. On 200 the returned
    /// pair is installed and the session is brought fully open; the raw
    /// status and body are returned either way so the login page can mirror
    /// them.
    async fn sign_in(&mut self, payload: &SignInPayload) -> Result<SignInOutcome> {
        let response = self
            .client
            .post(self.api_url("sign-in"))
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if status == 200 {
            let tokens: TokenPairResponse = serde_json::from_str(&body)?;
            self.store.set(CredentialPair {
                access_token: tokens.token,
                refresh_token: tokens.refresh_token,
            });
            tracing::info!("authentication successful");
            self.update_user_limits().await?;
            self.start_refresher().await;
        }

        Ok(SignInOutcome { status, body })
    }

    async fn handle_login_request(&mut self, stream: &mut TcpStream) -> Result<()> {
        let request = login_server::read_request(stream).await?;
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/api/login") => {
                let payload: SignInPayload = match serde_json::from_slice(&request.body) {
                    Ok(payload) => payload,
                    Err(_) => {
                        return login_server::write_response(
                            stream,
                            400,
                            "text/plain",
                            b"Bad Request: unable to parse JSON",
                        )
                        .await;
                    }
                };
                match self.sign_in(&payload).await {
                    Ok(outcome) => {
                        login_server::write_response(
                            stream,
                            outcome.status,
                            "application/json",
                            outcome.body.as_bytes(),
                        )
                        .await
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "sign-in attempt failed");
                        login_server::write_response(
                            stream,
                            500,
                            "text/plain",
                            format!("Internal Server Error: {err}").as_bytes(),
                        )
                        .await
                    }
                }
            }
            ("GET", path) => match login_server::asset(path) {
                Some((mime, body)) => {
                    login_server::write_response(stream, 200, mime, body).await
                }
                None => {
                    login_server::write_response(stream, 404, "text/plain", b"File Not Found")
                        .await
                }
            },
            _ => login_server::write_response(stream, 404, "text/plain", b"Not Found").await,
        }
    }

    /// Fetch the user quota snapshot and log any exceeded limits.
    async fn update_user_limits(&self) -> Result<()> {
        let limits = fetch_user_limits(&self.client, &self.api_url("users/limits"), &self.store)
            .await?;
        for warning in limits.warnings() {
            tracing::warn!(%warning, "user quota exceeded");
        }
        *self.user_limits.lock().expect("limits lock poisoned") = Some(limits);
        Ok(())
    }

    /// Replace any running refresher with a fresh one. The previous instance
    /// is stopped and joined first so two refreshers never race on the store.
    async fn start_refresher(&mut self) {
        if let Some(previous) = self.refresher.take() {
            previous.shutdown().await;
        }

        let client = self.client.clone();
        let refresh_url = self.api_url("access-token");
        let limits_url = self.api_url("users/limits");
        let store = self.store.clone();
        let limits = self.user_limits.clone();

        self.refresher = Some(Refresher::spawn(self.refresher_interval, move || {
            let client = client.clone();
            let refresh_url = refresh_url.clone();
            let limits_url = limits_url.clone();
            let store = store.clone();
            let limits = limits.clone();
            async move {
                let refresh_token = store.refresh_token().ok_or(LinkError::NotAuthenticated)?;
                let pair = refresh_credentials(&client, &refresh_url, &refresh_token).await?;
                store.set(pair);
                // Recompute the quota snapshot with the new credentials; a
                // failure here is non-fatal for the session.
                match fetch_user_limits(&client, &limits_url, &store).await {
                    Ok(new_limits) => {
                        for warning in new_limits.warnings() {
                            tracing::warn!(%warning, "user quota exceeded");
                        }
                        *limits.lock().expect("limits lock poisoned") = Some(new_limits);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "could not refresh user limits");
                    }
                }
                Ok(None)
            }
        }));
    }
}

impl Default for GridConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl JobService for GridConnection {
    fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn api_url(&self, path: &str) -> String {
        GridConnection::api_url(self, path)
    }

    fn auth_header(&self) -> Result<String> {
        self.store.bearer_header().ok_or(LinkError::NotAuthenticated)
    }
}

impl fmt::Display for GridConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GridConnection:")?;
        writeln!(f, "├── url: {}", self.base_url)?;
        if let Some(limits) = self.user_limits() {
            if limits.enabled_execution_time == Some(true) {
                if let (Some(used), Some(max)) =
                    (limits.used_execution_time, limits.max_execution_time)
                {
                    writeln!(
                        f,
                        "├── Computing time: {}/{} minutes",
                        (used / 60.0).round(),
                        (max / 60.0).round()
                    )?;
                }
            }
            if limits.enabled_max_executions == Some(true) {
                if let (Some(used), Some(max)) = (limits.used_executions, limits.max_executions) {
                    writeln!(f, "├── Executions: {used}/{max}")?;
                }
            }
            if limits.enabled_max_timeout == Some(true) {
                if let Some(max) = limits.max_timeout {
                    writeln!(f, "├── Max time limit per request: {} minutes", max.round())?;
                }
            }
        }
        write!(
            f,
            "└── status: {}",
            if self.is_open() { "open" } else { "closed" }
        )
    }
}

/// Exchange a refresh token for a new credential pair.
async fn refresh_credentials(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
) -> Result<CredentialPair> {
    let response = client
        .post(url)
        .timeout(REQUEST_TIMEOUT)
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        return Err(LinkError::Authentication(format!(
            "access-token refresh failed with status {}",
            response.status().as_u16()
        )));
    }
    let tokens: TokenPairResponse = response.json().await?;
    Ok(CredentialPair {
        access_token: tokens.token,
        refresh_token: tokens.refresh_token,
    })
}

async fn fetch_user_limits(
    client: &reqwest::Client,
    url: &str,
    store: &CredentialStore,
) -> Result<UserLimits> {
    let auth = store.bearer_header().ok_or(LinkError::NotAuthenticated)?;
    let response = client
        .get(url)
        .header(reqwest::header::AUTHORIZATION, auth)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        let status = response.status().as_u16();
        return Err(LinkError::request(status, server_message(response).await));
    }
    Ok(response.json().await?)
}

/// Server `message` field from an error body, or a placeholder.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| "Unknown error".to_string())
}
