//! Session authentication: credential storage, background renewal, the
//! browser-login loopback server, and token persistence.

pub mod credentials;
pub mod login_server;
pub mod refresher;
pub mod token_file;

pub use credentials::{CredentialPair, CredentialStore};
pub use refresher::Refresher;
