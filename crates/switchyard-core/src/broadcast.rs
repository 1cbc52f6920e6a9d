use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

/// Total bytes a broadcaster will buffer before giving up on the stream.
const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// How one fan-out stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Upstream emitted a terminal error event or the transport broke.
    Error(String),
    IdleTimeout,
    TotalTimeout,
    /// Every subscriber left; the upstream was abandoned, not judged.
    Cancelled,
}

#[derive(Debug)]
struct Shared {
    chunks: Vec<Bytes>,
    buffered_bytes: usize,
    outcome: Option<StreamOutcome>,
}

/// Single-producer fan-out buffer. The owner task pushes already-normalized
/// SSE frames; each subscriber replays from the beginning at its own pace.
/// Once a subscriber has reached the live edge, lagging more than `lag_max`
/// chunks behind the producer disconnects it.
#[derive(Debug)]
pub struct Broadcaster {
    shared: Mutex<Shared>,
    notify: Notify,
    lag_max: usize,
    subscribers: AtomicUsize,
    primary_recorded: AtomicBool,
}

/// Returned when a subscriber fell too far behind and was cut off.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("subscriber lagged past the backlog limit")]
pub struct Lagged;

impl Broadcaster {
    pub fn new(lag_max: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                chunks: Vec::new(),
                buffered_bytes: 0,
                outcome: None,
            }),
            notify: Notify::new(),
            lag_max,
            subscribers: AtomicUsize::new(0),
            primary_recorded: AtomicBool::new(false),
        })
    }

    /// Append one chunk and wake waiting subscribers. Chunks pushed after the
    /// terminal outcome are dropped.
    pub fn push(&self, chunk: Bytes) {
        {
            let mut shared = lock(&self.shared);
            if shared.outcome.is_some() {
                return;
            }
            if shared.buffered_bytes + chunk.len() > MAX_BUFFER_BYTES {
                shared.outcome = Some(StreamOutcome::Error(
                    "broadcast buffer limit exceeded".to_string(),
                ));
            } else {
                shared.buffered_bytes += chunk.len();
                shared.chunks.push(chunk);
            }
        }
        self.notify.notify_waiters();
    }

    /// Record the terminal outcome. First writer wins.
    pub fn finish(&self, outcome: StreamOutcome) {
        {
            let mut shared = lock(&self.shared);
            if shared.outcome.is_none() {
                shared.outcome = Some(outcome);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        lock(&self.shared).outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.shared).outcome.is_some()
    }

    /// New subscriber cursor; replays the full backlog from chunk zero. The
    /// lag limit does not apply until the subscriber first reaches the live
    /// edge, so a late joiner always catches up on retained history.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        Subscriber {
            broadcaster: Arc::clone(self),
            cursor: 0,
            caught_up: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// The owner request has recorded health/dedup state; together with an
    /// empty subscriber list this permits upstream cancellation.
    pub fn mark_primary_recorded(&self) {
        self.primary_recorded.store(true, Ordering::SeqCst);
    }

    pub fn should_cancel_upstream(&self) -> bool {
        self.primary_recorded.load(Ordering::SeqCst) && self.subscriber_count() == 0
    }
}

#[derive(Debug)]
pub struct Subscriber {
    broadcaster: Arc<Broadcaster>,
    cursor: usize,
    /// Set once this cursor has reached the producer's live edge. Only then
    /// does falling behind count as lag: a fresh cursor replaying the
    /// retained backlog is not a slow consumer.
    caught_up: bool,
}

impl Subscriber {
    /// Next chunk in order. `Ok(None)` after the terminal outcome once the
    /// backlog is drained; `Err(Lagged)` if this subscriber reached the live
    /// stream and then fell too far behind the producer.
    pub async fn next(&mut self) -> Result<Option<Bytes>, Lagged> {
        loop {
            // Register interest before checking state; a push between the
            // check and the await would otherwise be missed.
            let notified = self.broadcaster.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let shared = lock(&self.broadcaster.shared);
                let available = shared.chunks.len();
                if available > self.cursor {
                    if self.caught_up && available - self.cursor > self.broadcaster.lag_max {
                        return Err(Lagged);
                    }
                    let chunk = shared.chunks[self.cursor].clone();
                    self.cursor += 1;
                    if self.cursor == available {
                        self.caught_up = true;
                    }
                    return Ok(Some(chunk));
                }
                self.caught_up = true;
                if shared.outcome.is_some() {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.broadcaster.outcome()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.broadcaster.subscribers.fetch_sub(1, Ordering::SeqCst);
        // Wake the producer side so cancellation checks re-run.
        self.broadcaster.notify.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
