//! Auth gate: token and password checks for every host request.
//!
//! The password is sent in the clear with each request and only its SHA-256
//! digest is kept by the host. This is a LAN-only scheme without transport
//! encryption; the token alone is not secret-strength.

use crate::config::HostConfig;
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_LEN: usize = 14;

/// Hex-encoded SHA-256 digest of a password.
pub fn digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Fresh random opaque token for one host run.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn ct_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// The secret half of a host configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub password_hash: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, password: &str) -> Self {
        Self {
            token: token.into(),
            password_hash: digest(password),
        }
    }

    /// True only if both the token and the password digest match.
    /// Both comparisons always run so timing does not reveal which one failed.
    pub fn authorize(&self, token: &str, password: &str) -> bool {
        let token_ok = ct_eq(token, &self.token);
        let password_ok = ct_eq(&digest(password), &self.password_hash);
        token_ok & password_ok
    }
}

/// Gate every host operation runs through before touching the filesystem.
pub fn authorize(config: &HostConfig, token: &str, password: &str) -> bool {
    config.credentials.authorize(token, password)
}
