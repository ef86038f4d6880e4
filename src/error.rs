// src/error.rs
use crate::parser::ParseError;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Central error type for the uvhttp core engine.
#[derive(Debug, Error)]
pub enum UvhttpError {
    /// API misuse: bad argument or configuration. No side effects.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// Connection slot table reached its maximum capacity.
    #[error("connection slab is full")]
    SlabFull,
    /// A response was sent twice on the same request cycle.
    #[error("response already sent")]
    DoubleSend,
    /// Protocol upgrade handshake was malformed.
    #[error("upgrade rejected: {0}")]
    UpgradeRejected(&'static str),
    /// A background worker thread failed to start or panicked.
    #[error("worker error: {0}")]
    Worker(String),
    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type UvhttpResult<T> = Result<T, UvhttpError>;

/// Error classes tracked by the per-server telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorKind {
    InvalidParam = 0,
    ParseProtocol,
    ParseOversize,
    RouteNotFound,
    RateLimited,
    IoTransient,
    IoFatal,
    UpgradeRejected,
    DoubleSend,
    SlabFull,
}

const ERROR_KIND_COUNT: usize = 10;

/// Per-server error statistics, shared with every worker.
///
/// Counters are relaxed atomics; the last-error context is a short
/// human-readable string plus the unix timestamp it was recorded at.
/// Deliberately not a process-wide global: two servers in one process
/// keep separate books.
#[derive(Debug, Default)]
pub struct ErrorStats {
    counts: [AtomicU64; ERROR_KIND_COUNT],
    last: Mutex<Option<LastError>>,
}

#[derive(Debug, Clone)]
pub struct LastError {
    pub context: String,
    pub at: u64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: ErrorKind, context: &str) {
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(LastError {
                context: context.to_string(),
                at,
            });
        }
    }

    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last.lock().ok().and_then(|l| l.clone())
    }

    pub fn reset(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_and_reset() {
        let stats = ErrorStats::new();
        assert_eq!(stats.count(ErrorKind::RateLimited), 0);

        stats.record(ErrorKind::RateLimited, "peer 10.0.0.1 over limit");
        stats.record(ErrorKind::RateLimited, "peer 10.0.0.2 over limit");
        stats.record(ErrorKind::ParseProtocol, "bad request line");

        assert_eq!(stats.count(ErrorKind::RateLimited), 2);
        assert_eq!(stats.count(ErrorKind::ParseProtocol), 1);
        let last = stats.last_error().unwrap();
        assert_eq!(last.context, "bad request line");
        assert!(last.at > 0);

        stats.reset();
        assert_eq!(stats.count(ErrorKind::RateLimited), 0);
        assert!(stats.last_error().is_none());
    }
}
