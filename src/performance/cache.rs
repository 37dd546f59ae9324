//! TTL + LRU cache for session metadata.
//!
//! Entries expire lazily on read and in bulk from an optional sweeper task.
//! The session list is a single entry with its own, shorter TTL. Any change to
//! one session also drops the cached list.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CacheConfig;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Session(String),
    SessionList,
}

#[derive(Debug, Clone)]
enum CachedValue {
    Session(Session),
    List(Vec<Session>),
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
}

impl CacheInner {
    fn lookup(&mut self, key: &CacheKey) -> Option<CachedValue> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.expired(now) => {
                self.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
            self.expirations += 1;
        }
        self.misses += 1;
        None
    }

    fn purge(&mut self, now: Instant) -> usize {
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.entries.pop(key);
        }
        self.expirations += stale.len() as u64;
        stale.len()
    }

    fn store(&mut self, key: CacheKey, value: CachedValue, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        if let Some((displaced, _)) = self.entries.push(key.clone(), entry) {
            if displaced != key {
                self.evictions += 1;
            }
        }
    }
}

/// Hit/miss counters plus current occupancy.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Mutex<CacheInner>>,
    session_ttl: Duration,
    list_ttl: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                expirations: 0,
                evictions: 0,
            })),
            session_ttl: Duration::from_millis(config.session_ttl_ms),
            list_ttl: Duration::from_millis(config.list_ttl_ms),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms.max(1)),
            cancel: CancellationToken::new(),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cache_session(&self, session: &Session) {
        let mut inner = self.inner.lock();
        inner.store(
            CacheKey::Session(session.id.clone()),
            CachedValue::Session(session.clone()),
            self.session_ttl,
        );
    }

    /// Cache the full listing and refresh each member's entry.
    pub fn cache_session_list(&self, sessions: &[Session]) {
        let mut inner = self.inner.lock();
        for session in sessions {
            inner.store(
                CacheKey::Session(session.id.clone()),
                CachedValue::Session(session.clone()),
                self.session_ttl,
            );
        }
        inner.store(
            CacheKey::SessionList,
            CachedValue::List(sessions.to_vec()),
            self.list_ttl,
        );
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        match self.inner.lock().lookup(&CacheKey::Session(id.to_string()))? {
            CachedValue::Session(session) => Some(session),
            CachedValue::List(_) => None,
        }
    }

    pub fn get_session_list(&self) -> Option<Vec<Session>> {
        match self.inner.lock().lookup(&CacheKey::SessionList)? {
            CachedValue::List(sessions) => Some(sessions),
            CachedValue::Session(_) => None,
        }
    }

    /// Drop one session and the cached listing that may contain it.
    pub fn invalidate_session(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.entries.pop(&CacheKey::Session(id.to_string()));
        inner.entries.pop(&CacheKey::SessionList);
    }

    pub fn invalidate_list(&self) {
        self.inner.lock().entries.pop(&CacheKey::SessionList);
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().entries.clear();
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge(Instant::now())
    }

    /// Spawn the periodic sweeper. A second call replaces the first task.
    pub fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.cancel.clone();
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(sweep_loop(weak, cancel, interval));
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            capacity: inner.entries.cap().get(),
            hits: inner.hits,
            misses: inner.misses,
            expirations: inner.expirations,
            evictions: inner.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Stop the sweeper and clear all entries.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "cache sweeper ended abnormally");
            }
        }
        self.invalidate_all();
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("entries", &self.inner.lock().entries.len())
            .field("session_ttl", &self.session_ttl)
            .field("list_ttl", &self.list_ttl)
            .finish()
    }
}

async fn sweep_loop(inner: Weak<Mutex<CacheInner>>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let removed = inner.lock().purge(Instant::now());
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
    }
}
