//! Outbound call throttling and retry backoff.
//!
//! Each call kind gets its own minimum spacing. Callers reserve the next free
//! slot under a short lock and then sleep outside it, so concurrent workers
//! queue up instead of bursting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::RateLimitConfig;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    PostCreation,
    NotificationFetch,
    ContentLookup,
}

impl CallKind {
    pub fn label(self) -> &'static str {
        match self {
            CallKind::PostCreation => "post creation",
            CallKind::NotificationFetch => "notification fetch",
            CallKind::ContentLookup => "content lookup",
        }
    }
}

pub struct RateLimiter {
    spacing: HashMap<CallKind, Duration>,
    next_slot: Mutex<HashMap<CallKind, Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_spacing([
            (
                CallKind::PostCreation,
                Duration::from_millis(config.post_min_spacing_ms),
            ),
            (
                CallKind::NotificationFetch,
                Duration::from_millis(config.notification_min_spacing_ms),
            ),
            (
                CallKind::ContentLookup,
                Duration::from_millis(config.lookup_min_spacing_ms),
            ),
        ])
    }

    pub fn with_spacing<I>(spacing: I) -> Self
    where
        I: IntoIterator<Item = (CallKind, Duration)>,
    {
        Self {
            spacing: spacing.into_iter().collect(),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// No spacing at all. Handy for tests.
    pub fn unlimited() -> Self {
        Self::with_spacing(std::iter::empty())
    }

    /// Wait until a call of `kind` may be issued.
    pub async fn acquire(&self, kind: CallKind) {
        let spacing = self.spacing.get(&kind).copied().unwrap_or_default();
        if spacing.is_zero() {
            return;
        }

        let wait = {
            let mut slots = match self.next_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let slot = slots.get(&kind).copied().unwrap_or(now).max(now);
            slots.insert(kind, slot + spacing);
            slot - now
        };

        if !wait.is_zero() {
            tracing::debug!("Throttling {} for {:?}", kind.label(), wait);
            sleep(wait).await;
        }
    }
}

/// Exponential backoff with a ceiling and a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_retry_attempts,
        )
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = match &e {
                        AgentError::RateLimited {
                            retry_after: Some(after),
                            ..
                        } => (*after).min(self.max),
                        _ => self.delay_for(attempt),
                    };
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
