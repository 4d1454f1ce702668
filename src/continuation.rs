//! Single-use continuation tokens for operations that paused to wait for the
//! user.
//!
//! A paused operation parks its payload here under a fresh random token and
//! the caller gets the token back. Resubmitting the request with the token
//! consumes the entry. Entries live only in process memory and expire after a
//! bounded time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::Clock;

/// Opaque continuation token handed to the calling app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Uuid);

impl TokenId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Why a resume found nothing. Only logged; callers see one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The request carried no token.
    Absent,
    /// The entry outlived its time to live.
    Expired,
    /// Never issued, already consumed, cancelled, or not written in time.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("continuation not found")]
pub struct ContinuationNotFound {
    pub reason: NotFoundReason,
}

impl ContinuationNotFound {
    fn new(reason: NotFoundReason) -> Self {
        Self { reason }
    }
}

struct Entry<T> {
    payload: T,
    created: SystemTime,
}

enum Taken<T> {
    Found(T),
    Expired,
    Missing,
}

/// In-memory map of paused operations.
pub struct ContinuationStore<T> {
    entries: Mutex<HashMap<TokenId, Entry<T>>>,
    written: Notify,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    resume_wait: Duration,
    max_pending: usize,
}

impl<T> ContinuationStore<T> {
    pub fn new(
        clock: Arc<dyn Clock>,
        ttl: Duration,
        resume_wait: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            written: Notify::new(),
            clock,
            ttl,
            resume_wait,
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TokenId, Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, created: SystemTime, now: SystemTime) -> bool {
        now.duration_since(created)
            .map(|age| age >= self.ttl)
            .unwrap_or(false)
    }

    /// Park `payload` and return the token that resumes it.
    pub fn pause(&self, payload: T) -> TokenId {
        let token = TokenId::generate();
        self.insert(token, payload);
        tracing::debug!(token = %token, "paused operation");
        token
    }

    /// Park `payload` again under a token that was just resumed, so the
    /// caller keeps using the handle it already has.
    pub fn rearm(&self, token: TokenId, payload: T) {
        self.insert(token, payload);
        tracing::debug!(token = %token, "re-armed continuation");
    }

    fn insert(&self, token: TokenId, payload: T) {
        let now = self.clock.now();
        {
            let mut entries = self.lock();
            entries.retain(|_, entry| !self.is_expired(entry.created, now));

            while entries.len() >= self.max_pending {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.created)
                    .map(|(token, _)| *token);
                let Some(oldest) = oldest else { break };
                entries.remove(&oldest);
                tracing::warn!(token = %oldest, "continuation map full, evicted oldest entry");
            }

            entries.insert(
                token,
                Entry {
                    payload,
                    created: now,
                },
            );
        }
        self.written.notify_waiters();
    }

    fn take(&self, token: TokenId) -> Taken<T> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let taken = match entries.remove(&token) {
            Some(entry) if self.is_expired(entry.created, now) => Taken::Expired,
            Some(entry) => Taken::Found(entry.payload),
            None => Taken::Missing,
        };
        if entries.is_empty() {
            entries.shrink_to_fit();
        }
        taken
    }

    /// Consume the entry for `token`.
    ///
    /// A token that is not there yet is waited for, up to the configured
    /// resume wait. Whatever the reason, a missing entry comes back as
    /// [`ContinuationNotFound`].
    pub async fn resume(&self, token: Option<TokenId>) -> Result<T, ContinuationNotFound> {
        let Some(token) = token else {
            tracing::debug!("resume without a continuation token");
            return Err(ContinuationNotFound::new(NotFoundReason::Absent));
        };

        let deadline = tokio::time::Instant::now() + self.resume_wait;
        loop {
            let notified = self.written.notified();
            tokio::pin!(notified);
            // Register before looking so a write in between is not missed.
            notified.as_mut().enable();

            match self.take(token) {
                Taken::Found(payload) => {
                    tracing::debug!(token = %token, "resumed operation");
                    return Ok(payload);
                }
                Taken::Expired => {
                    tracing::info!(token = %token, "continuation expired");
                    return Err(ContinuationNotFound::new(NotFoundReason::Expired));
                }
                Taken::Missing => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::info!(token = %token, "unknown continuation token");
                return Err(ContinuationNotFound::new(NotFoundReason::Unknown));
            }
        }
    }

    /// Look at a live entry without consuming it.
    pub fn inspect<R>(&self, token: TokenId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let now = self.clock.now();
        let entries = self.lock();
        entries
            .get(&token)
            .filter(|entry| !self.is_expired(entry.created, now))
            .map(|entry| f(&entry.payload))
    }

    /// Drop an entry. Returns whether one was there.
    pub fn cancel(&self, token: TokenId) -> bool {
        matches!(self.take(token), Taken::Found(_) | Taken::Expired)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
