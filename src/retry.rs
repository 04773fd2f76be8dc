//! Bounded retries with exponential backoff for a single work item.
//!
//! Each item walks `Pending -> Attempting -> {Succeeded | Retrying -> Attempting | PermanentlyFailed}`.
//! [`RetryPolicy::after_attempt`] holds every transition decision, so the policy can be
//! exercised without any networking.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::FetchError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Rate-limited responses without `Retry-After` wait this many times the normal backoff.
const RATE_LIMIT_FACTOR: u32 = 4;

/// One identifier awaiting processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    /// Attempts already made.
    pub attempt: u32,
    pub state: ItemState,
}

impl WorkItem {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            attempt: 0,
            state: ItemState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Attempting,
    Retrying(Duration),
    Succeeded,
    PermanentlyFailed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::PermanentlyFailed)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry_limit: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Allows `retry_limit` retries after the first attempt.
    pub fn new(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay_for(&self, attempt: u32, err: &FetchError) -> Duration {
        match err {
            FetchError::RateLimited {
                retry_after: Some(after),
            } => (*after).min(self.max_backoff),
            FetchError::RateLimited { retry_after: None } => self
                .backoff(attempt)
                .saturating_mul(RATE_LIMIT_FACTOR)
                .min(self.max_backoff),
            _ => self.backoff(attempt),
        }
    }

    /// State an item moves to once its `attempt`-th attempt produced `result`.
    pub fn after_attempt(&self, attempt: u32, result: Result<(), &FetchError>) -> ItemState {
        match result {
            Ok(()) => ItemState::Succeeded,
            Err(err) if !err.is_transient() => ItemState::PermanentlyFailed,
            Err(_) if attempt > self.retry_limit => ItemState::PermanentlyFailed,
            Err(err) => ItemState::Retrying(self.delay_for(attempt, err)),
        }
    }

    /// Drives `item` to a terminal state, calling `attempt_fn` once per attempt.
    ///
    /// Returns the payload on success, or the last error once the item failed permanently.
    pub async fn run<F, Fut>(
        &self,
        item: &mut WorkItem,
        mut attempt_fn: F,
    ) -> Result<String, FetchError>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<String, FetchError>>,
    {
        loop {
            item.state = ItemState::Attempting;
            item.attempt += 1;
            let result = attempt_fn(item.id).await;

            item.state = self.after_attempt(item.attempt, result.as_ref().map(|_| ()));
            match item.state {
                ItemState::Retrying(delay) => {
                    if let Err(err) = &result {
                        debug!(
                            id = item.id,
                            attempt = item.attempt,
                            max = self.retry_limit.saturating_add(1),
                            ?delay,
                            "retrying after {err}"
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                ItemState::PermanentlyFailed => {
                    if let Err(err) = &result {
                        if err.is_transient() {
                            warn!(id = item.id, attempts = item.attempt, "giving up: {err}");
                        }
                    }
                    return result;
                }
                _ => return result,
            }
        }
    }
}
