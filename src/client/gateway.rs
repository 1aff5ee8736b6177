//! Connection through a third-party API gateway.
//!
//! The gateway authenticates with OAuth client credentials instead of the
//! cloud service's sign-in endpoint: a consumer key/secret pair is exchanged
//! for a JWT-style token that is replaced wholesale before it expires.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::auth::Refresher;
use crate::client::build_http_client;
use crate::client::service::{JobService, REQUEST_TIMEOUT};
use crate::error::{LinkError, Result};
use crate::types::JwtToken;

/// Default production gateway.
pub const DEFAULT_GATEWAY_URL: &str = "https://gateway.gridlink.io";

const KEY_ENV: &str = "GRIDLINK_CONSUMER_KEY";
const SECRET_ENV: &str = "GRIDLINK_CONSUMER_SECRET";

/// Fraction of the token lifetime after which it is renewed.
const REFRESH_FRACTION: f64 = 0.8;

/// Authenticated session against the job service behind the gateway.
///
/// # Example
/// ```no_run
/// use gridlink::GatewayConnection;
///
/// # async fn example() -> gridlink::Result<()> {
/// let mut conn = GatewayConnection::new()
///     .with_credentials("my-consumer-key", "my-consumer-secret");
/// conn.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayConnection {
    base_url: String,
    client: reqwest::Client,
    consumer_key: Option<String>,
    consumer_secret: Option<String>,
    token: Arc<Mutex<Option<JwtToken>>>,
    refresher: Option<Refresher>,
}

impl GatewayConnection {
    pub fn new() -> Self {
        Self::with_url(DEFAULT_GATEWAY_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            base_url: url.into(),
            client: build_http_client(),
            consumer_key: None,
            consumer_secret: None,
            token: Arc::new(Mutex::new(None)),
            refresher: None,
        }
    }

    pub fn with_credentials(
        mut self,
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
    ) -> Self {
        self.consumer_key = Some(consumer_key.into());
        self.consumer_secret = Some(consumer_secret.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of the current gateway token.
    pub fn token(&self) -> Option<JwtToken> {
        self.token.lock().expect("token lock poisoned").clone()
    }

    /// Connect using the configured consumer key/secret, falling back to the
    /// `GRIDLINK_CONSUMER_KEY` / `GRIDLINK_CONSUMER_SECRET` environment
    /// variables. A no-op when the session is already open.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let key = self
            .consumer_key
            .clone()
            .or_else(|| std::env::var(KEY_ENV).ok())
            .ok_or_else(|| {
                LinkError::Authentication(format!(
                    "no consumer key provided and {KEY_ENV} is unset"
                ))
            })?;
        let secret = self
            .consumer_secret
            .clone()
            .or_else(|| std::env::var(SECRET_ENV).ok())
            .ok_or_else(|| {
                LinkError::Authentication(format!(
                    "no consumer secret provided and {SECRET_ENV} is unset"
                ))
            })?;
        self.consumer_key = Some(key.clone());
        self.consumer_secret = Some(secret.clone());

        let token = fetch_gateway_token(&self.client, &self.token_url(), &key, &secret).await?;
        let interval = refresh_interval(&token);
        *self.token.lock().expect("token lock poisoned") = Some(token);

        self.start_refresher(interval, key, secret).await;
        tracing::info!(url = %self.base_url, "connected to gateway");
        Ok(())
    }

    /// Stop the refresher and drop the token. Idempotent.
    pub async fn close(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            tracing::info!(url = %self.base_url, "closing gateway connection");
            refresher.shutdown().await;
        }
        *self.token.lock().expect("token lock poisoned") = None;
    }

    /// True iff the refresher task is alive and a token is present.
    pub fn is_open(&self) -> bool {
        self.refresher.as_ref().is_some_and(Refresher::is_alive)
            && self.token.lock().expect("token lock poisoned").is_some()
    }

    fn token_url(&self) -> String {
        format!("{}/token", self.base_url.trim_end_matches('/'))
    }

    async fn start_refresher(&mut self, interval: Duration, key: String, secret: String) {
        if let Some(previous) = self.refresher.take() {
            previous.shutdown().await;
        }

        let client = self.client.clone();
        let token_url = self.token_url();
        let token = self.token.clone();

        self.refresher = Some(Refresher::spawn(interval, move || {
            let client = client.clone();
            let token_url = token_url.clone();
            let token = token.clone();
            let key = key.clone();
            let secret = secret.clone();
            async move {
                let new_token = fetch_gateway_token(&client, &token_url, &key, &secret).await?;
                // The next renewal follows the new token's own lifetime.
                let next = refresh_interval(&new_token);
                *token.lock().expect("token lock poisoned") = Some(new_token);
                Ok(Some(next))
            }
        }));
    }
}

impl Default for GatewayConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl JobService for GatewayConnection {
    fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/gridlink/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn auth_header(&self) -> Result<String> {
        self.token
            .lock()
            .expect("token lock poisoned")
            .as_ref()
            .map(|t| format!("Bearer {}", t.access_token))
            .ok_or(LinkError::NotAuthenticated)
    }
}

impl fmt::Display for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GatewayConnection:")?;
        writeln!(f, "├── url: {}", self.base_url)?;
        if let Some(token) = self.token() {
            writeln!(f, "├── token_type: {}", token.token_type)?;
            writeln!(f, "├── expires_in: {}s", token.expires_in)?;
        }
        write!(
            f,
            "└── status: {}",
            if self.is_open() { "open" } else { "closed" }
        )
    }
}

/// Exchange consumer credentials for a gateway token.
async fn fetch_gateway_token(
    client: &reqwest::Client,
    url: &str,
    consumer_key: &str,
    consumer_secret: &str,
) -> Result<JwtToken> {
    let creds = base64::engine::general_purpose::STANDARD
        .encode(format!("{consumer_key}:{consumer_secret}"));
    let response = client
        .post(url)
        .header(AUTHORIZATION, format!("Basic {creds}"))
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body("grant_type=client_credentials")
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        return Err(LinkError::Authentication(format!(
            "gateway token request failed with status {}",
            response.status().as_u16()
        )));
    }
    Ok(response.json().await?)
}

/// Renewal cadence: a fraction of the token's lifetime, never less than a
/// second.
fn refresh_interval(token: &JwtToken) -> Duration {
    Duration::from_secs_f64((token.expires_in as f64 * REFRESH_FRACTION).max(1.0))
}
