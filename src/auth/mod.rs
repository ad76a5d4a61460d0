//! Bearer credential storage and lookup for signaling-channel authentication.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stored bearer token with optional expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    pub expires_at: Option<u64>,
}

impl StoredToken {
    pub fn new(token: String, expires_in_secs: Option<u64>) -> Self {
        let expires_at = expires_in_secs.map(|secs| unix_now() + secs);
        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            // Consider expired if less than 60 seconds remaining, so a token
            // about to lapse is not used to open a new connection.
            Some(exp) => unix_now() + 60 >= exp,
            None => false,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Supplies a currently valid bearer credential for channel authentication.
///
/// Returns `None` when no credential is stored or the stored one has expired;
/// the signaling layer fails fast in that case instead of attempting to
/// connect with a bad token.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed in-memory credential, mainly for tests and short-lived sessions.
pub struct StaticCredentials(pub Option<String>);

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}
