use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::broadcast::Broadcaster;

/// A finished unary exchange, replayable to duplicate waiters.
#[derive(Debug, Clone)]
pub struct SharedResponse {
    pub status: u16,
    pub body: Bytes,
}

/// What a duplicate waiter receives from the owner.
#[derive(Debug, Clone)]
pub enum SharedOutcome {
    Unary(SharedResponse),
    Stream(Arc<Broadcaster>),
}

enum EntryState {
    /// Owner is working; duplicates queue for the outcome.
    Pending {
        waiters: Vec<oneshot::Sender<SharedOutcome>>,
    },
    /// Owner attached a live (or recently finished) broadcaster.
    Streaming { broadcaster: Arc<Broadcaster> },
}

struct Entry {
    state: EntryState,
    inserted_at: Instant,
}

/// The caller's role for one fingerprint.
pub enum BeginRole {
    /// First arrival: perform the upstream call and settle the entry.
    Owner,
    /// Duplicate of a unary (or not-yet-published) request.
    Wait(oneshot::Receiver<SharedOutcome>),
    /// Duplicate of a streaming request with a published broadcaster.
    Join(Arc<Broadcaster>),
}

/// In-flight request map. One mutex; entries are small and the critical
/// sections are short. Stale owners are demoted by TTL so a hung request
/// cannot wedge its fingerprint.
pub struct DedupRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, fingerprint: &str, ttl: Duration) -> BeginRole {
        let mut entries = lock(&self.entries);
        Self::evict_expired(&mut entries, ttl);

        match entries.get_mut(fingerprint) {
            None => {
                entries.insert(
                    fingerprint.to_string(),
                    Entry {
                        state: EntryState::Pending {
                            waiters: Vec::new(),
                        },
                        inserted_at: Instant::now(),
                    },
                );
                BeginRole::Owner
            }
            Some(entry) => match &mut entry.state {
                EntryState::Pending { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(event = "dedup.wait", fingerprint, waiters = waiters.len());
                    BeginRole::Wait(rx)
                }
                EntryState::Streaming { broadcaster } => {
                    debug!(event = "dedup.join_stream", fingerprint);
                    BeginRole::Join(broadcaster.clone())
                }
            },
        }
    }

    /// Owner only: settle a unary result and wake every waiter with it.
    pub fn complete(&self, fingerprint: &str, response: SharedResponse) {
        self.settle(fingerprint, SharedOutcome::Unary(response));
    }

    /// Owner only: settle a failure. Waiters receive the same error body.
    pub fn fail(&self, fingerprint: &str, response: SharedResponse) {
        self.settle(fingerprint, SharedOutcome::Unary(response));
    }

    /// Owner only: attach the broadcaster for a streaming request. Existing
    /// waiters receive it and replay from the beginning; the entry stays
    /// joinable until its TTL expires.
    pub fn publish_stream(&self, fingerprint: &str, broadcaster: Arc<Broadcaster>) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(fingerprint) else {
            return;
        };
        let previous = std::mem::replace(
            &mut entry.state,
            EntryState::Streaming {
                broadcaster: broadcaster.clone(),
            },
        );
        entry.inserted_at = Instant::now();
        if let EntryState::Pending { waiters } = previous {
            for waiter in waiters {
                let _ = waiter.send(SharedOutcome::Stream(broadcaster.clone()));
            }
        }
    }

    /// Drop an entry without waking anyone (owner gave up before settling;
    /// waiters see a closed channel and retry as owners).
    pub fn abandon(&self, fingerprint: &str) {
        lock(&self.entries).remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, fingerprint: &str, outcome: SharedOutcome) {
        let Some(entry) = lock(&self.entries).remove(fingerprint) else {
            return;
        };
        if let EntryState::Pending { waiters } = entry.state {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn evict_expired(entries: &mut HashMap<String, Entry>, ttl: Duration) {
        // A stale pending owner is demoted: dropping its senders closes the
        // waiters' channels, and the next begin() claims ownership. Expired
        // streaming entries stop accepting late joiners.
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }
}

impl Default for DedupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
