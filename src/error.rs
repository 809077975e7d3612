//! Session-level error taxonomy.
//!
//! Per-session errors stay within the session: the worst outcome is that
//! one connection closes. Store and config errors have their own types
//! (`DbError`, `ConfigError`); server-level failures use `anyhow` at the
//! binary boundary.

use thiserror::Error;

use tether_proto::ProtocolError;

/// Errors that terminate (at most) one session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Client authentication or upstream SASL failure.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The bounded queue toward a downstream overflowed.
    #[error("client too slow, dropping connection")]
    SlowClient,

    /// The upstream connection was lost; wraps the underlying cause.
    #[error("upstream disconnected: {0}")]
    UpstreamDisconnected(String),

    /// Too many malformed lines in a short window.
    #[error("too many malformed lines")]
    MalformedFlood,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sliding threshold over codec rejections: a session tolerates
/// malformed lines (they are logged and dropped) until it exceeds
/// `limit` of them inside `window`.
#[derive(Debug)]
pub struct MalformedCounter {
    window: std::time::Duration,
    limit: usize,
    hits: std::collections::VecDeque<std::time::Instant>,
}

impl MalformedCounter {
    pub fn new(limit: usize, window: std::time::Duration) -> Self {
        MalformedCounter {
            window,
            limit,
            hits: std::collections::VecDeque::new(),
        }
    }

    /// Record one rejection; returns true when the threshold is crossed.
    pub fn record(&mut self, now: std::time::Instant) -> bool {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.hits.len() > self.limit
    }
}

impl Default for MalformedCounter {
    fn default() -> Self {
        MalformedCounter::new(16, std::time::Duration::from_secs(60))
    }
}
