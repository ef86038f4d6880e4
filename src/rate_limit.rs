// src/rate_limit.rs
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Answer 429 with `Retry-After: <secs>`.
    Limited { retry_after: u64 },
}

/// Per-server fixed-window limiter.
///
/// One bucket for the whole server. Window start (epoch seconds) and the
/// in-window count are packed into a single atomic word, so both the
/// counter bump and the window rollover are CAS transitions and the check
/// stays exact when several reactor threads share the bucket. Whitelisted
/// peers (textual addresses, O(1) membership) skip the bucket entirely.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window_secs: u64,
    /// High 32 bits: window start in epoch seconds. Low 32 bits: count.
    state: AtomicU64,
    whitelist: HashSet<String>,
}

fn pack(start: u32, count: u32) -> u64 {
    ((start as u64) << 32) | count as u64
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window_secs: window_secs.max(1),
            state: AtomicU64::new(0),
            whitelist: HashSet::new(),
        }
    }

    pub fn with_whitelist<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn add_whitelist(&mut self, addr: &str) {
        self.whitelist.insert(addr.to_string());
    }

    pub fn is_whitelisted(&self, addr: &str) -> bool {
        self.whitelist.contains(addr)
    }

    pub fn check(&self, peer: &str) -> RateDecision {
        self.check_at(peer, unix_now())
    }

    /// Check with an explicit clock, so window rollover is testable.
    pub fn check_at(&self, peer: &str, now: u64) -> RateDecision {
        if self.whitelist.contains(peer) {
            return RateDecision::Allowed;
        }
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (start, count) = unpack(cur);
            if now >= start as u64 + self.window_secs {
                // Window elapsed: whoever wins the CAS owns the reset.
                if self
                    .state
                    .compare_exchange(cur, pack(now as u32, 1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return RateDecision::Allowed;
                }
                continue;
            }
            if count >= self.limit {
                return RateDecision::Limited {
                    retry_after: start as u64 + self.window_secs - now,
                };
            }
            if self
                .state
                .compare_exchange(cur, pack(start, count + 1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return RateDecision::Allowed;
            }
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
