use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pkce::PkceCodes;
use crate::store::{SecretStore, StoreError};
use crate::token::OAuthToken;

/// Refresh this long before the access token expires.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);
/// Maximum jitter added to a scheduled refresh.
const REFRESH_JITTER_MAX: Duration = Duration::from_secs(30);
/// Re-arm delay after a failed refresh (beyond the immediate retry).
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("no usable oauth tokens")]
    NoUsableTokens,
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("account {0} has no refresh token")]
    MissingRefreshToken(String),
    #[error("token endpoint request failed: {0}")]
    Request(String),
    #[error("token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("token endpoint response missing {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
        }
    }
}

/// Wire-facing token inventory row for /oauth/status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenStatus {
    pub account_email: String,
    pub expires_in_seconds: i64,
    pub healthy: bool,
    pub usage_count: u64,
    pub last_used: Option<i64>,
    pub scopes: Vec<String>,
}

#[derive(Default)]
struct TokenTable {
    tokens: HashMap<String, OAuthToken>,
    /// Round-robin order; emails in insertion order.
    order: Vec<String>,
    cursor: usize,
}

#[derive(Debug, Deserialize)]
struct TokenResponseRaw {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

struct Shared {
    config: OAuthConfig,
    http: wreq::Client,
    store: Arc<dyn SecretStore>,
    table: Mutex<TokenTable>,
    schedules: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Multi-account token store with round-robin issuance and scheduled
/// refreshes. Cheap to clone; every mutation is persisted to the secret
/// store.
#[derive(Clone)]
pub struct TokenManager {
    shared: Arc<Shared>,
}

impl TokenManager {
    pub fn new(config: OAuthConfig, store: Arc<dyn SecretStore>) -> Result<Self, OAuthError> {
        let http = wreq::Client::builder()
            .build()
            .map_err(|err| OAuthError::Request(err.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                http,
                store,
                table: Mutex::new(TokenTable::default()),
                schedules: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Load persisted tokens and start their refresh schedules.
    pub async fn load(&self) -> Result<usize, OAuthError> {
        let Some(payload) = self.shared.store.load()? else {
            return Ok(0);
        };
        let tokens: Vec<OAuthToken> = serde_json::from_str(&payload)
            .map_err(|err| OAuthError::Request(format!("persisted tokens unreadable: {err}")))?;
        let count = tokens.len();
        let mut schedule = Vec::with_capacity(count);
        {
            let mut table = self.shared.table.lock().await;
            for token in tokens {
                schedule.push((token.account_email.clone(), token.expires_at));
                if !table.tokens.contains_key(&token.account_email) {
                    table.order.push(token.account_email.clone());
                }
                table.tokens.insert(token.account_email.clone(), token);
            }
        }
        for (email, expires_at) in schedule {
            self.schedule_refresh(&email, expires_at).await;
        }
        info!(event = "oauth.loaded", accounts = count);
        Ok(count)
    }

    /// Insert or replace one token, persist, and (re)schedule its refresh.
    pub async fn put_token(&self, token: OAuthToken) -> Result<(), OAuthError> {
        let email = token.account_email.clone();
        let expires_at = token.expires_at;
        {
            let mut table = self.shared.table.lock().await;
            if !table.tokens.contains_key(&email) {
                table.order.push(email.clone());
            }
            table.tokens.insert(email.clone(), token);
            self.persist(&table)?;
        }
        self.schedule_refresh(&email, expires_at).await;
        Ok(())
    }

    /// Next usable token in round-robin order. Increments its usage counter.
    pub async fn issue_token(&self) -> Result<(String, String), OAuthError> {
        let mut table = self.shared.table.lock().await;
        if table.order.is_empty() {
            return Err(OAuthError::NoUsableTokens);
        }
        let len = table.order.len();
        let start = table.cursor;
        for step in 0..len {
            let email = table.order[(start + step) % len].clone();
            let usable = table
                .tokens
                .get(&email)
                .is_some_and(OAuthToken::is_usable);
            if !usable {
                continue;
            }
            table.cursor = (start + step + 1) % len;
            let token = table
                .tokens
                .get_mut(&email)
                .ok_or_else(|| OAuthError::UnknownAccount(email.clone()))?;
            token.usage_count += 1;
            token.last_used = Some(OffsetDateTime::now_utc().unix_timestamp());
            let access = token.access_token.clone();
            self.persist(&table)?;
            return Ok((access, email));
        }
        Err(OAuthError::NoUsableTokens)
    }

    /// Complete a PKCE authorization-code exchange and store the result under
    /// `account_email`.
    pub async fn exchange_code(&self, code: &str, account_email: &str) -> Result<(), OAuthError> {
        // Pasted codes often carry a `#state` fragment or query tail.
        let cleaned = code.split(['#', '&']).next().unwrap_or(code);
        let pkce = PkceCodes::generate();
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.shared.config.client_id.as_str()),
            ("code", cleaned),
            ("redirect_uri", self.shared.config.redirect_uri.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
            ("state", pkce.state.as_str()),
        ];
        let payload = form
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let response = self
            .shared
            .http
            .post(&self.shared.config.token_url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await
            .map_err(|err| OAuthError::Request(err.to_string()))?;
        let raw = read_token_response(response).await?;

        let token = OAuthToken {
            account_email: account_email.to_string(),
            access_token: raw.access_token,
            refresh_token: raw.refresh_token,
            expires_at: expires_at_from(raw.expires_in),
            scopes: split_scopes(raw.scope.as_deref()),
            usage_count: 0,
            last_used: None,
            refresh_failed: false,
        };
        info!(event = "oauth.exchanged", account = account_email);
        self.put_token(token).await
    }

    /// Refresh one account now. A failure is retried once immediately; after
    /// a second failure the schedule re-arms an hour out and the token is
    /// flagged, which makes it unusable once the access token expires.
    pub async fn refresh(&self, account_email: &str) -> Result<(), OAuthError> {
        match self.attempt_refresh(account_email).await {
            Ok(expires_at) => {
                self.schedule_refresh(account_email, expires_at).await;
                Ok(())
            }
            Err(first_error) => {
                warn!(
                    event = "oauth.refresh_retry",
                    account = account_email,
                    error = %first_error,
                );
                match self.attempt_refresh(account_email).await {
                    Ok(expires_at) => {
                        self.schedule_refresh(account_email, expires_at).await;
                        Ok(())
                    }
                    Err(second_error) => {
                        self.mark_refresh_failed(account_email).await?;
                        self.schedule_at(account_email, REFRESH_RETRY_DELAY + jitter())
                            .await;
                        Err(second_error)
                    }
                }
            }
        }
    }

    pub async fn refresh_all(&self) -> Vec<(String, Result<(), OAuthError>)> {
        let emails: Vec<String> = {
            let table = self.shared.table.lock().await;
            table.order.clone()
        };
        let mut results = Vec::with_capacity(emails.len());
        for email in emails {
            let result = self.refresh(&email).await;
            results.push((email, result));
        }
        results
    }

    pub async fn delete(&self, account_email: &str) -> Result<(), OAuthError> {
        {
            let mut table = self.shared.table.lock().await;
            if table.tokens.remove(account_email).is_none() {
                return Err(OAuthError::UnknownAccount(account_email.to_string()));
            }
            table.order.retain(|email| email != account_email);
            table.cursor = 0;
            self.persist(&table)?;
        }
        if let Some(handle) = self.shared.schedules.lock().await.remove(account_email) {
            handle.abort();
        }
        info!(event = "oauth.deleted", account = account_email);
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), OAuthError> {
        {
            let mut table = self.shared.table.lock().await;
            table.tokens.clear();
            table.order.clear();
            table.cursor = 0;
        }
        for (_, handle) in self.shared.schedules.lock().await.drain() {
            handle.abort();
        }
        self.shared.store.clear()?;
        info!(event = "oauth.cleared");
        Ok(())
    }

    pub async fn status(&self) -> Vec<TokenStatus> {
        let table = self.shared.table.lock().await;
        let mut rows: Vec<TokenStatus> = table
            .tokens
            .values()
            .map(|token| TokenStatus {
                account_email: token.account_email.clone(),
                expires_in_seconds: token.expires_in_seconds(),
                healthy: token.is_usable(),
                usage_count: token.usage_count,
                last_used: token.last_used,
                scopes: token.scopes.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.account_email.cmp(&b.account_email));
        rows
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.table.lock().await.tokens.is_empty()
    }

    async fn attempt_refresh(&self, account_email: &str) -> Result<i64, OAuthError> {
        let refresh_token = {
            let table = self.shared.table.lock().await;
            let token = table
                .tokens
                .get(account_email)
                .ok_or_else(|| OAuthError::UnknownAccount(account_email.to_string()))?;
            token
                .refresh_token
                .clone()
                .ok_or_else(|| OAuthError::MissingRefreshToken(account_email.to_string()))?
        };

        let payload = json!({
            "grant_type": "refresh_token",
            "client_id": self.shared.config.client_id,
            "refresh_token": refresh_token,
        });
        let response = self
            .shared
            .http
            .post(&self.shared.config.token_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| OAuthError::Request(err.to_string()))?;
        let raw = read_token_response(response).await?;
        let expires_at = expires_at_from(raw.expires_in);

        let mut table = self.shared.table.lock().await;
        let token = table
            .tokens
            .get_mut(account_email)
            .ok_or_else(|| OAuthError::UnknownAccount(account_email.to_string()))?;
        token.access_token = raw.access_token;
        if raw.refresh_token.is_some() {
            token.refresh_token = raw.refresh_token;
        }
        token.expires_at = expires_at;
        token.refresh_failed = false;
        if let Some(scope) = raw.scope.as_deref() {
            token.scopes = split_scopes(Some(scope));
        }
        self.persist(&table)?;
        info!(event = "oauth.refreshed", account = account_email);
        Ok(expires_at)
    }

    async fn mark_refresh_failed(&self, account_email: &str) -> Result<(), OAuthError> {
        let mut table = self.shared.table.lock().await;
        if let Some(token) = table.tokens.get_mut(account_email) {
            token.refresh_failed = true;
            self.persist(&table)?;
        }
        Ok(())
    }

    async fn schedule_refresh(&self, account_email: &str, expires_at: i64) {
        let delay =
            refresh_delay(expires_at, OffsetDateTime::now_utc().unix_timestamp()) + jitter();
        self.schedule_at(account_email, delay).await;
    }

    async fn schedule_at(&self, account_email: &str, delay: Duration) {
        let manager = self.clone();
        let email = account_email.to_string();
        let task_email = email.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own schedule entry so the refresh below can re-arm
            // without aborting the running task.
            manager.shared.schedules.lock().await.remove(&task_email);
            if let Err(err) = manager.refresh(&task_email).await {
                warn!(event = "oauth.refresh_failed", account = %task_email, error = %err);
            }
        });
        if let Some(previous) = self.shared.schedules.lock().await.insert(email, handle) {
            previous.abort();
        }
    }

    fn persist(&self, table: &TokenTable) -> Result<(), OAuthError> {
        let mut tokens: Vec<&OAuthToken> = table.tokens.values().collect();
        tokens.sort_by(|a, b| a.account_email.cmp(&b.account_email));
        let payload = serde_json::to_string(&tokens)
            .map_err(|err| OAuthError::Request(format!("serialize tokens: {err}")))?;
        self.shared.store.save(&payload)?;
        Ok(())
    }
}

async fn read_token_response(response: wreq::Response) -> Result<TokenResponseRaw, OAuthError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| OAuthError::Request(err.to_string()))?;
    if !status.is_success() {
        return Err(OAuthError::Endpoint {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    serde_json::from_slice(&body).map_err(|_| OAuthError::MissingField("access_token"))
}

/// Delay until `expires_at − 5min`, never negative. Jitter is added by the
/// caller so the window property stays testable.
pub(crate) fn refresh_delay(expires_at: i64, now: i64) -> Duration {
    let target = expires_at - REFRESH_LEAD.as_secs() as i64;
    Duration::from_secs(target.saturating_sub(now).max(0) as u64)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..REFRESH_JITTER_MAX.as_millis() as u64))
}

fn expires_at_from(expires_in: Option<i64>) -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() + expires_in.unwrap_or(3600)
}

fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn token(email: &str, expires_in: i64) -> OAuthToken {
        OAuthToken {
            account_email: email.to_string(),
            access_token: format!("access-{email}"),
            refresh_token: Some(format!("refresh-{email}")),
            expires_at: OffsetDateTime::now_utc().unix_timestamp() + expires_in,
            scopes: vec!["user:inference".to_string()],
            usage_count: 0,
            last_used: None,
            refresh_failed: false,
        }
    }

    fn manager() -> TokenManager {
        TokenManager::new(OAuthConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn issue_token_rotates_round_robin() {
        let manager = manager();
        manager.put_token(token("a@example.com", 3600)).await.unwrap();
        manager.put_token(token("b@example.com", 3600)).await.unwrap();

        let (_, first) = manager.issue_token().await.unwrap();
        let (_, second) = manager.issue_token().await.unwrap();
        let (_, third) = manager.issue_token().await.unwrap();
        assert_eq!(first, "a@example.com");
        assert_eq!(second, "b@example.com");
        assert_eq!(third, "a@example.com");

        let status = manager.status().await;
        let a = status
            .iter()
            .find(|row| row.account_email == "a@example.com")
            .unwrap();
        assert_eq!(a.usage_count, 2);
        assert!(a.last_used.is_some());
    }

    #[tokio::test]
    async fn unusable_tokens_are_skipped() {
        let manager = manager();
        let mut dead = token("dead@example.com", -10);
        dead.refresh_failed = true;
        manager.put_token(dead).await.unwrap();
        manager.put_token(token("live@example.com", 3600)).await.unwrap();

        for _ in 0..3 {
            let (_, email) = manager.issue_token().await.unwrap();
            assert_eq!(email, "live@example.com");
        }
    }

    #[tokio::test]
    async fn issue_fails_with_no_tokens() {
        let manager = manager();
        assert!(matches!(
            manager.issue_token().await,
            Err(OAuthError::NoUsableTokens)
        ));
    }

    #[tokio::test]
    async fn tokens_persist_and_reload() {
        let store = Arc::new(MemoryStore::new());
        let manager = TokenManager::new(OAuthConfig::default(), store.clone()).unwrap();
        manager.put_token(token("a@example.com", 3600)).await.unwrap();
        manager.issue_token().await.unwrap();

        let restored = TokenManager::new(OAuthConfig::default(), store).unwrap();
        assert_eq!(restored.load().await.unwrap(), 1);
        let status = restored.status().await;
        assert_eq!(status[0].account_email, "a@example.com");
        assert_eq!(status[0].usage_count, 1);
    }

    #[tokio::test]
    async fn delete_and_clear_remove_tokens() {
        let manager = manager();
        manager.put_token(token("a@example.com", 3600)).await.unwrap();
        manager.put_token(token("b@example.com", 3600)).await.unwrap();

        manager.delete("a@example.com").await.unwrap();
        assert!(matches!(
            manager.delete("a@example.com").await,
            Err(OAuthError::UnknownAccount(_))
        ));
        manager.clear().await.unwrap();
        assert!(manager.is_empty().await);
    }

    #[test]
    fn refresh_delay_targets_five_minutes_before_expiry() {
        let now = 1_700_000_000;
        // Expires in six minutes: refresh in one minute.
        assert_eq!(refresh_delay(now + 360, now), Duration::from_secs(60));
        // Already inside the lead window: refresh immediately.
        assert_eq!(refresh_delay(now + 120, now), Duration::ZERO);
        assert_eq!(refresh_delay(now - 10, now), Duration::ZERO);
    }
}
