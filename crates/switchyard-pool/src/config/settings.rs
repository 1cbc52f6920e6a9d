use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_key: String,
    pub exempt_paths: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            exempt_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub selection_strategy: SelectionStrategy,
    /// Seconds an unhealthy provider stays unselectable.
    pub failure_cooldown: u64,
    /// Seconds the last successful provider is promoted to the head.
    pub sticky_provider_duration: u64,
    /// Qualifying failures before a provider is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Substrings matched against decoded response bodies.
    pub unhealthy_error_types: Vec<String>,
    pub unhealthy_http_codes: Vec<u16>,
    /// Regexes matched against decoded response bodies.
    pub unhealthy_response_body_patterns: Vec<String>,
    pub request_timeout: u64,
    pub streaming_total_timeout: u64,
    pub streaming_idle_timeout: u64,
    pub deduplication_enabled: bool,
    /// Seconds an in-flight dedup entry (and a completed broadcaster backlog)
    /// stays joinable.
    pub deduplication_ttl: u64,
    /// Chunks a subscriber may lag before it is disconnected.
    pub subscriber_backlog_max: usize,
    /// Concurrent upstream connections allowed per provider.
    pub max_provider_connections: usize,
    pub auth: AuthSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::Priority,
            failure_cooldown: 180,
            sticky_provider_duration: 300,
            unhealthy_threshold: 2,
            unhealthy_error_types: vec![
                "overloaded".to_string(),
                "insufficient credit".to_string(),
                "rate limit".to_string(),
            ],
            unhealthy_http_codes: vec![
                402, 404, 408, 429, 500, 502, 503, 504, 520, 521, 522, 523, 524,
            ],
            unhealthy_response_body_patterns: Vec::new(),
            request_timeout: 120,
            streaming_total_timeout: 600,
            streaming_idle_timeout: 60,
            deduplication_enabled: true,
            deduplication_ttl: 60,
            subscriber_backlog_max: 256,
            max_provider_connections: 128,
            auth: AuthSettings::default(),
        }
    }
}

impl Settings {
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown)
    }

    pub fn sticky_provider_duration(&self) -> Duration {
        Duration::from_secs(self.sticky_provider_duration)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn streaming_total_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming_total_timeout)
    }

    pub fn streaming_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming_idle_timeout)
    }

    pub fn deduplication_ttl(&self) -> Duration {
        Duration::from_secs(self.deduplication_ttl)
    }
}
