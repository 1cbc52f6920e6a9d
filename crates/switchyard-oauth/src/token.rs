use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One stored account token. Serialized as-is into the secret store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub account_email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    /// Unix seconds of the last issuance.
    #[serde(default)]
    pub last_used: Option<i64>,
    /// Set once a refresh attempt has failed; cleared by a successful one.
    #[serde(default)]
    pub refresh_failed: bool,
}

impl OAuthToken {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() >= self.expires_at
    }

    pub fn expires_in_seconds(&self) -> i64 {
        self.expires_at - OffsetDateTime::now_utc().unix_timestamp()
    }

    /// A token stays usable until it is known-expired and a refresh attempt
    /// has already failed.
    pub fn is_usable(&self) -> bool {
        !(self.is_expired() && self.refresh_failed)
    }
}
