//! Mutex-guarded storage for the session's bearer credentials.

use std::sync::Mutex;

/// The rotating bearer credentials of one session.
///
/// Always replaced as a pair so a refresh token is never attached to a stale
/// access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// In-memory credential store guarded by a single mutex.
///
/// All reads and writes go through the lock; no operation performs I/O or
/// blocks beyond the lock acquisition itself.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: Mutex<Option<CredentialPair>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current pair, if any.
    pub fn get(&self) -> Option<CredentialPair> {
        self.inner.lock().expect("credential lock poisoned").clone()
    }

    /// Replace both tokens atomically.
    pub fn set(&self, pair: CredentialPair) {
        *self.inner.lock().expect("credential lock poisoned") = Some(pair);
    }

    /// Drop both tokens.
    pub fn clear(&self) {
        *self.inner.lock().expect("credential lock poisoned") = None;
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .map(|p| p.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .map(|p| p.refresh_token.clone())
    }

    /// `Authorization` header value derived from the current access token,
    /// read under the same lock as every credential update.
    pub fn bearer_header(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("credential lock poisoned")
            .as_ref()
            .map(|p| format!("Bearer {}", p.access_token))
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("credential lock poisoned")
            .is_none()
    }
}
