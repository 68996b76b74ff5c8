use super::SharedCache;
use parking_lot::Mutex;
use propel_execution::UserId;
use propel_integration::limit::SlidingWindow;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{info, warn};

/// Client action subject to per-user rate limiting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LimitAction {
    PlaceOrder,
    ModifyPosition,
    ClosePosition,
    Subscribe,
    Unsubscribe,
    Default,
}

impl LimitAction {
    pub fn key_fragment(&self) -> &'static str {
        match self {
            LimitAction::PlaceOrder => "place_order",
            LimitAction::ModifyPosition => "modify_position",
            LimitAction::ClosePosition => "close_position",
            LimitAction::Subscribe => "subscribe",
            LimitAction::Unsubscribe => "unsubscribe",
            LimitAction::Default => "default",
        }
    }

    /// Allowed operations per second.
    pub fn per_second(&self) -> usize {
        match self {
            LimitAction::PlaceOrder => 10,
            LimitAction::ModifyPosition => 20,
            LimitAction::ClosePosition => 20,
            LimitAction::Subscribe => 5,
            LimitAction::Unsubscribe => 5,
            LimitAction::Default => 100,
        }
    }
}

/// Per (user, action) token bucket.
///
/// Counters live in the shared cache (`INCR` + TTL) so limits hold across processes. On a
/// cache outage the limiter degrades to local sliding windows and reconverges once the
/// cache returns, discarding the stale local state.
pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    fallback: Mutex<HashMap<(UserId, &'static str), SlidingWindow>>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("degraded", &self.degraded.load(Ordering::SeqCst))
            .finish()
    }
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self {
            cache,
            fallback: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the limiter is running on local fallback windows.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Check (and consume) one permit for the user/action. Returns `false` when limited.
    pub async fn check(&self, user_id: UserId, action: LimitAction) -> bool {
        let key = format!("ratelimit:{}:{}", action.key_fragment(), user_id);

        match self
            .cache
            .incr_with_ttl(&key, Duration::from_secs(1))
            .await
        {
            Ok(count) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    // Cache is back: drop stale local windows and trust the shared counter
                    self.fallback.lock().clear();
                    info!("rate limiter reconverged onto shared counters");
                }
                count <= action.per_second() as u64
            }
            Err(error) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(?error, "rate limiter degraded to local fallback");
                }
                self.fallback
                    .lock()
                    .entry((user_id, action.key_fragment()))
                    .or_insert_with(|| {
                        SlidingWindow::new(action.per_second(), Duration::from_secs(1))
                    })
                    .try_acquire()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySharedCache;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_shared_counter_enforces_limit() {
        let cache = Arc::new(InMemorySharedCache::new());
        let limiter = RateLimiter::new(cache);
        let user = UserId(Uuid::new_v4());

        for i in 0..10 {
            assert!(
                limiter.check(user, LimitAction::PlaceOrder).await,
                "call {i} should be allowed"
            );
        }
        assert!(!limiter.check(user, LimitAction::PlaceOrder).await);
        assert!(!limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_actions_limited_independently() {
        let cache = Arc::new(InMemorySharedCache::new());
        let limiter = RateLimiter::new(cache);
        let user = UserId(Uuid::new_v4());

        for _ in 0..10 {
            assert!(limiter.check(user, LimitAction::PlaceOrder).await);
        }
        assert!(!limiter.check(user, LimitAction::PlaceOrder).await);

        // A different action has its own bucket
        assert!(limiter.check(user, LimitAction::ClosePosition).await);
    }

    #[tokio::test]
    async fn test_fallback_on_cache_outage_and_reconvergence() {
        let cache = Arc::new(InMemorySharedCache::new());
        let limiter = RateLimiter::new(Arc::clone(&cache) as Arc<dyn SharedCache>);
        let user = UserId(Uuid::new_v4());

        cache.set_failing(true);

        // 12 calls in one second: first 10 pass on the local bucket, the rest are limited
        for i in 0..12 {
            let allowed = limiter.check(user, LimitAction::PlaceOrder).await;
            if i < 10 {
                assert!(allowed, "call {i} should pass on the local bucket");
            } else {
                assert!(!allowed, "call {i} should be limited");
            }
        }
        assert!(limiter.is_degraded());

        // Cache returns: limiter reconverges and the shared counter takes over
        cache.set_failing(false);
        assert!(limiter.check(user, LimitAction::PlaceOrder).await);
        assert!(!limiter.is_degraded());
    }
}
