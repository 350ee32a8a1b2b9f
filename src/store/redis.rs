use crate::settings::Settings;
use crate::store::{StoreError, WindowSnapshot, WindowStore, DEFAULT_STORE_TIMEOUT_MILLIS};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use std::time::Duration;

const SEQUENCE_SUFFIX: &str = ":seq";

// KEYS[1] = sorted set of event timestamps, KEYS[2] = per key sequence counter
// ARGV[1] = now (ms), ARGV[2] = window (ms), ARGV[3] = limit
static SLIDING_WINDOW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local key = KEYS[1]
local seq_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
    local seq = redis.call('INCR', seq_key)
    redis.call('ZADD', key, now, ARGV[1] .. '-' .. seq)
    -- A narrower window never shortens the expiry set by a wider one
    if redis.call('PTTL', key) < window then
        redis.call('PEXPIRE', key, window)
    end
    if redis.call('PTTL', seq_key) < window then
        redis.call('PEXPIRE', seq_key, window)
    end
    count = count + 1
    admitted = 1
end

local oldest = -1
local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if head[2] then
    oldest = tonumber(head[2])
end

return {admitted, count, oldest}
",
    )
});

/// A sliding window [WindowStore] backed by Redis.
///
/// Each key is a sorted set of request timestamps. A single Lua script prunes, counts and records,
/// so the check is atomic across every replica talking to the same Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    timeout: Duration,
}

impl RedisWindowStore {
    /// Create a Builder.
    ///
    /// # Arguments
    ///
    /// * `connection`: A multiplexed, reconnecting [ConnectionManager], shared by all clones.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_sliding_window_rate_limit::store::redis::RedisWindowStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisWindowStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
            timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MILLIS),
        }
    }

    /// Connect using the URL, key prefix and timeout from [Settings].
    pub async fn connect(settings: &Settings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.redis_url.as_str())
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        Ok(Self::builder(manager)
            .key_prefix(settings.key_prefix.as_deref())
            .timeout(settings.store_timeout())
            .build())
    }

}

/// Redis keys for the window and its sequence counter.
///
/// The prefixed key is wrapped in a hash tag so both land in the same Redis Cluster slot.
fn window_keys(key_prefix: Option<&str>, key: &str) -> (String, String) {
    let window_key = format!("{{{}{key}}}", key_prefix.unwrap_or_default());
    let sequence_key = format!("{window_key}{SEQUENCE_SUFFIX}");
    (window_key, sequence_key)
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    timeout: Duration,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    ///
    /// Keys are stored as `{<prefix><key>}` together with a `{<prefix><key>}:seq` counter.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    /// Upper bound on a single script invocation, after which the check fails with
    /// [StoreError::Timeout]. Defaults to 50ms.
    ///
    /// The script may still run to completion on the server after the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> RedisWindowStore {
        RedisWindowStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn execute(
        &self,
        key: &str,
        limit: u64,
        window_millis: u64,
        now_millis: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        let (window_key, sequence_key) = window_keys(self.key_prefix.as_deref(), key);

        let mut invocation = SLIDING_WINDOW_SCRIPT.prepare_invoke();
        invocation
            .key(window_key)
            .key(sequence_key)
            .arg(now_millis)
            .arg(window_millis)
            .arg(limit);

        let mut con = self.connection.clone();
        let reply: Vec<i64> =
            actix_web::rt::time::timeout(self.timeout, invocation.invoke_async(&mut con))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))?
                .map_err(classify)?;
        parse_reply(&reply)
    }
}

// Errors where the script never ran because the server was not serving writes.
fn classify(e: RedisError) -> StoreError {
    let not_serving = matches!(
        e.kind(),
        ErrorKind::BusyLoadingError
            | ErrorKind::ReadOnly
            | ErrorKind::MasterDown
            | ErrorKind::TryAgain
            | ErrorKind::ClusterDown
    );
    if not_serving
        || e.is_io_error()
        || e.is_connection_refusal()
        || e.is_timeout()
        || e.is_connection_dropped()
    {
        StoreError::Unavailable(Box::new(e))
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn parse_reply(reply: &[i64]) -> Result<WindowSnapshot, StoreError> {
    let (admitted, count, oldest) = match reply {
        [admitted, count, oldest] => (*admitted, *count, *oldest),
        _ => {
            return Err(StoreError::Protocol(format!(
                "expected 3 values from the sliding window script, got {}",
                reply.len()
            )))
        }
    };
    let admitted = match admitted {
        0 => false,
        1 => true,
        other => {
            return Err(StoreError::Protocol(format!(
                "admission flag must be 0 or 1, got {other}"
            )))
        }
    };
    let count = u64::try_from(count)
        .map_err(|_| StoreError::Protocol(format!("negative window count {count}")))?;
    Ok(WindowSnapshot {
        admitted,
        count,
        oldest_millis: u64::try_from(oldest).ok(),
    })
}
