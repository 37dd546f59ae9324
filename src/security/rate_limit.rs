//! Per-source sliding-window rate limiter with a cool-down block.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SourceWindow {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Admits at most `max_requests` per `window` for each source. The request
/// that would exceed the budget starts a block of `block` during which every
/// request is refused; afterwards the window starts empty.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    block: Duration,
    sources: HashMap<String, SourceWindow>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize, block: Duration) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            block,
            sources: HashMap::new(),
        }
    }

    /// Record one request; `Err` carries the remaining block time.
    pub fn check(&mut self, source: &str) -> Result<usize, Duration> {
        self.check_at(source, Instant::now())
    }

    pub fn check_at(&mut self, source: &str, now: Instant) -> Result<usize, Duration> {
        let entry = self.sources.entry(source.to_string()).or_default();
        if let Some(until) = entry.blocked_until {
            if now < until {
                return Err(until - now);
            }
            entry.blocked_until = None;
            entry.hits.clear();
        }
        while entry
            .hits
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= self.window)
        {
            entry.hits.pop_front();
        }
        if entry.hits.len() >= self.max_requests {
            entry.blocked_until = Some(now + self.block);
            return Err(self.block);
        }
        entry.hits.push_back(now);
        Ok(self.max_requests - entry.hits.len())
    }

    /// Drop sources with no recent hits and no active block.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.sources.retain(|_, entry| {
            entry.blocked_until.is_some_and(|until| now < until)
                || entry
                    .hits
                    .back()
                    .is_some_and(|hit| now.duration_since(*hit) < window)
        });
    }

    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}
