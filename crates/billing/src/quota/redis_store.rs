//! Redis quota counters
//!
//! The check-and-increment runs as a Lua script, which Redis executes
//! atomically. Counters expire on their own a day after their window closes,
//! so pruning has nothing to do here.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use time::Date;

use super::{ConsumeOutcome, QuotaKey, QuotaStore};
use crate::error::BillingResult;

/// KEYS[1] counter, ARGV[1] amount, ARGV[2] limit, ARGV[3] ttl seconds.
/// Returns {1, used} when applied and {0, used} when rejected.
const CONSUME_SCRIPT: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
if used + amount > limit then
    return {0, used}
end
used = redis.call('INCRBY', KEYS[1], amount)
if used == amount then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
end
return {1, used}
"#;

/// Window length plus one day of grace for late reads
const COUNTER_TTL_SECS: u64 = 2 * 24 * 60 * 60;

pub struct RedisQuotaStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisQuotaStore {
    pub async fn connect(url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected quota store to Redis");
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(CONSUME_SCRIPT),
        }
    }

    fn counter_key(key: &QuotaKey) -> String {
        format!("quota:{}:{}:{}", key.user_id, key.resource, key.day)
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn try_consume(
        &self,
        key: &QuotaKey,
        amount: u32,
        limit: u32,
    ) -> BillingResult<ConsumeOutcome> {
        let mut conn = self.conn.clone();
        let (applied, used): (i64, i64) = self
            .script
            .key(Self::counter_key(key))
            .arg(amount)
            .arg(limit)
            .arg(COUNTER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        let used = u32::try_from(used).unwrap_or(u32::MAX);
        if applied == 1 {
            Ok(ConsumeOutcome::Consumed { used })
        } else {
            Ok(ConsumeOutcome::Rejected { used })
        }
    }

    async fn used(&self, key: &QuotaKey) -> BillingResult<u32> {
        let mut conn = self.conn.clone();
        let used: Option<u32> = redis::cmd("GET")
            .arg(Self::counter_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(used.unwrap_or(0))
    }

    async fn prune_before(&self, _day: Date) -> BillingResult<u64> {
        Ok(0)
    }
}
