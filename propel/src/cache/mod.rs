use crate::{engine::price::PriceTick, error::CacheError};
use async_trait::async_trait;
use propel_execution::AccountId;
use redis::AsyncCommands;
use std::time::Duration;

/// Per (user, action) token buckets backed by the shared counter store, with a local
/// degraded-mode fallback.
pub mod rate_limit;

/// Engine deadline for any single cache round trip.
const CACHE_DEADLINE: Duration = Duration::from_secs(1);

/// Shared cache / coordination service interface.
///
/// Used for cross-process rate-limit counters, per-symbol price snapshots read by external
/// components, and account-event fan-out. Every operation is best-effort from the engine's
/// perspective: a cache outage degrades features but never blocks the trading path.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Atomically increment the counter at `key`, applying `ttl` on first increment.
    /// Returns the post-increment count.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, CacheError>;

    /// Write the per-symbol price snapshot hash.
    async fn publish_price(&self, tick: &PriceTick) -> Result<(), CacheError>;

    /// Publish an account event on the account's fan-out channel.
    async fn publish_account_event(
        &self,
        account_id: AccountId,
        payload: &str,
    ) -> Result<(), CacheError>;
}

/// Redis-backed [`SharedCache`].
#[derive(Debug, Clone)]
pub struct RedisSharedCache {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisSharedCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(CacheError::from)?;
        let connection = tokio::time::timeout(
            CACHE_DEADLINE,
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout(CACHE_DEADLINE.as_millis() as u64))?
        .map_err(CacheError::from)?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let mut connection = self.connection.clone();
        tokio::time::timeout(CACHE_DEADLINE, async {
            let count: u64 = connection.incr(key, 1u64).await?;
            if count == 1 {
                let _: () = redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .query_async(&mut connection)
                    .await?;
            }
            Ok::<u64, redis::RedisError>(count)
        })
        .await
        .map_err(|_| CacheError::Timeout(CACHE_DEADLINE.as_millis() as u64))?
        .map_err(CacheError::from)
    }

    async fn publish_price(&self, tick: &PriceTick) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let key = format!("price:{}", tick.symbol);

        tokio::time::timeout(CACHE_DEADLINE, async {
            let _: () = redis::pipe()
                .atomic()
                .hset(&key, "bid", tick.bid.to_string())
                .hset(&key, "ask", tick.ask.to_string())
                .hset(&key, "mid", tick.mid.to_string())
                .hset(&key, "time", tick.time.to_rfc3339())
                .query_async(&mut connection)
                .await?;
            Ok::<(), redis::RedisError>(())
        })
        .await
        .map_err(|_| CacheError::Timeout(CACHE_DEADLINE.as_millis() as u64))?
        .map_err(CacheError::from)
    }

    async fn publish_account_event(
        &self,
        account_id: AccountId,
        payload: &str,
    ) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let channel = format!("account:{account_id}");

        tokio::time::timeout(CACHE_DEADLINE, async {
            let _: () = connection.publish(channel, payload).await?;
            Ok::<(), redis::RedisError>(())
        })
        .await
        .map_err(|_| CacheError::Timeout(CACHE_DEADLINE.as_millis() as u64))?
        .map_err(CacheError::from)
    }
}

/// In-memory [`SharedCache`] used by tests. `set_failing(true)` simulates a cache outage.
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    counters: parking_lot::Mutex<std::collections::HashMap<String, (u64, tokio::time::Instant)>>,
    failing: std::sync::atomic::AtomicBool,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(CacheError::Unavailable("simulated cache outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        self.check_available()?;
        let now = tokio::time::Instant::now();
        let mut counters = self.counters.lock();

        let entry = counters
            .entry(key.to_string())
            .and_modify(|(count, expires_at)| {
                if *expires_at <= now {
                    *count = 0;
                    *expires_at = now + ttl;
                }
                *count += 1;
            })
            .or_insert((1, now + ttl));

        Ok(entry.0)
    }

    async fn publish_price(&self, _tick: &PriceTick) -> Result<(), CacheError> {
        self.check_available()
    }

    async fn publish_account_event(
        &self,
        _account_id: AccountId,
        _payload: &str,
    ) -> Result<(), CacheError> {
        self.check_available()
    }
}
