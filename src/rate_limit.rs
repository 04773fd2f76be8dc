use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};

/// Optional requests/second gate shared by every worker.
///
/// A disabled pacer lets every call through, leaving the concurrency cap as the only limit.
#[derive(Clone, Default)]
pub struct Pacer {
    limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl Pacer {
    pub fn new(per_second: Option<NonZeroU32>) -> Self {
        Self {
            limiter: per_second.map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate)))),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Waits until a request may be issued.
    pub async fn until_ready(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}
