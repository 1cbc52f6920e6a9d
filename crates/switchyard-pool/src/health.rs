use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::classify::FailureKind;
use crate::config::{Provider, Settings};

/// Mutable health state for one provider. Guarded by its own mutex; the
/// selector holds it only long enough to read.
#[derive(Debug, Default)]
struct HealthState {
    error_count: u32,
    last_error_time: Option<OffsetDateTime>,
    unhealthy_since: Option<Instant>,
    unhealthy_since_wall: Option<OffsetDateTime>,
    last_success: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy)]
struct StickyEntry {
    set_at: Instant,
}

/// Result of one upstream exchange, as reported by the orchestrator.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

/// Wire-facing health snapshot for the /providers endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub enabled: bool,
    pub healthy: bool,
    pub error_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unhealthy_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

/// Tracks error counts, cooldowns, the sticky pointer, and round-robin
/// cursors. Cooldown expiry is lazy: selectability is recomputed on read.
pub struct HealthEngine {
    providers: Mutex<HashMap<String, HealthState>>,
    sticky: Mutex<Option<(String, StickyEntry)>>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl HealthEngine {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            sticky: Mutex::new(None),
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_selectable(&self, provider: &Provider, settings: &Settings) -> bool {
        if !provider.enabled {
            return false;
        }
        let guard = lock(&self.providers);
        let Some(state) = guard.get(&provider.name) else {
            return true;
        };
        match state.unhealthy_since {
            Some(since) => since.elapsed() >= settings.failure_cooldown(),
            None => true,
        }
    }

    /// Record one exchange result. Returns true when this call transitioned
    /// the provider to unhealthy. Non-qualifying failures are ignored.
    pub fn record_outcome(&self, provider: &str, outcome: Outcome, settings: &Settings) -> bool {
        match outcome {
            Outcome::Success => {
                {
                    let mut guard = lock(&self.providers);
                    let state = guard.entry(provider.to_string()).or_default();
                    state.error_count = 0;
                    state.unhealthy_since = None;
                    state.unhealthy_since_wall = None;
                    state.last_success = Some(OffsetDateTime::now_utc());
                }
                self.touch_sticky(provider);
                false
            }
            Outcome::Failure(kind) => {
                if !kind.is_qualifying() {
                    return false;
                }
                let mut guard = lock(&self.providers);
                let state = guard.entry(provider.to_string()).or_default();
                state.error_count += 1;
                state.last_error_time = Some(OffsetDateTime::now_utc());
                let crossed = state.error_count >= settings.unhealthy_threshold
                    && state.unhealthy_since.is_none();
                if crossed {
                    state.unhealthy_since = Some(Instant::now());
                    state.unhealthy_since_wall = Some(OffsetDateTime::now_utc());
                    warn!(
                        event = "health.marked_unhealthy",
                        provider,
                        error_count = state.error_count,
                        reason = %kind,
                        cooldown_secs = settings.failure_cooldown,
                    );
                } else {
                    info!(
                        event = "health.failure_recorded",
                        provider,
                        error_count = state.error_count,
                        reason = %kind,
                    );
                }
                crossed
            }
        }
    }

    pub fn error_count(&self, provider: &str) -> u32 {
        lock(&self.providers)
            .get(provider)
            .map(|state| state.error_count)
            .unwrap_or(0)
    }

    pub fn snapshot_for(&self, provider: &Provider) -> ProviderHealthSnapshot {
        let guard = lock(&self.providers);
        let state = guard.get(&provider.name);
        let unhealthy = state.is_some_and(|state| state.unhealthy_since.is_some());
        ProviderHealthSnapshot {
            name: provider.name.clone(),
            kind: match provider.kind {
                crate::config::ProviderKind::Anthropic => "anthropic",
                crate::config::ProviderKind::Openai => "openai",
            },
            enabled: provider.enabled,
            healthy: provider.enabled && !unhealthy,
            error_count: state.map(|state| state.error_count).unwrap_or(0),
            unhealthy_since: state.and_then(|state| state.unhealthy_since_wall),
            last_error_time: state.and_then(|state| state.last_error_time),
            last_success: state.and_then(|state| state.last_success),
        }
    }

    /// The sticky provider, if one is set and still within its window.
    pub fn sticky_provider(&self, settings: &Settings) -> Option<String> {
        let guard = lock(&self.sticky);
        let (name, entry) = guard.as_ref()?;
        (entry.set_at.elapsed() < settings.sticky_provider_duration()).then(|| name.clone())
    }

    fn touch_sticky(&self, provider: &str) {
        let mut guard = lock(&self.sticky);
        *guard = Some((
            provider.to_string(),
            StickyEntry {
                set_at: Instant::now(),
            },
        ));
    }

    /// Advance and return the round-robin cursor for one route pattern.
    pub fn next_round_robin(&self, route_pattern: &str) -> usize {
        let mut guard = lock(&self.round_robin);
        let cursor = guard.entry(route_pattern.to_string()).or_insert(0);
        let current = *cursor;
        *cursor = cursor.wrapping_add(1);
        current
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for HealthEngine {
    fn default() -> Self {
        Self::new()
    }
}
