//! Persisted token file: the sole durable session state.

use std::path::Path;

use crate::error::{LinkError, Result};
use crate::types::TokenFile;

/// Write `{token, url}` JSON to `path`.
pub fn save(path: &Path, refresh_token: &str, url: &str) -> Result<()> {
    let file = TokenFile {
        token: refresh_token.to_string(),
        url: url.to_string(),
    };
    let serialized = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, serialized)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Read a token file and verify it was issued against `expected_url`.
///
/// A URL mismatch fails before any network call; silently reusing a token
/// against the wrong server is never allowed.
pub fn load(path: &Path, expected_url: &str) -> Result<TokenFile> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        LinkError::Authentication(format!("failed to read token file {}: {err}", path.display()))
    })?;
    let file: TokenFile = serde_json::from_str(&raw)
        .map_err(|err| LinkError::Authentication(format!("malformed token file: {err}")))?;
    if file.url != expected_url {
        return Err(LinkError::Authentication(format!(
            "token file was issued for {} but the session targets {expected_url}",
            file.url
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip_preserves_token_and_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        save(&path, "rt-1", "https://cloud.example.com").unwrap();
        let file = load(&path, "https://cloud.example.com").unwrap();
        assert_eq!(file.token, "rt-1");
        assert_eq!(file.url, "https://cloud.example.com");
    }

    #[test]
    fn url_mismatch_is_an_authentication_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        save(&path, "rt-1", "https://cloud.example.com").unwrap();
        let err = load(&path, "https://other.example.com").unwrap_err();
        assert!(matches!(err, LinkError::Authentication(_)));
    }

    #[test]
    fn missing_file_is_an_authentication_error() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("missing.json"), "https://x").unwrap_err();
        assert!(matches!(err, LinkError::Authentication(_)));
    }

    #[test]
    fn malformed_json_is_an_authentication_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load(&path, "https://x").unwrap_err();
        assert!(matches!(err, LinkError::Authentication(_)));
    }
}
