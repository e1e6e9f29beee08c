//! Cache plane
//!
//! One Redis connection (auto-reconnecting) shared by the latest-value
//! cache, the device-secret escrow, the API-key validation cache, the token
//! blacklist and the rate-limiter counters. The service starts without the
//! cache and degrades: paths that strictly require it return 503.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

/// TTL of the one-time device secret escrow.
pub const CLAIM_SECRET_TTL_SECS: u64 = 300;
/// TTL of a validated API key entry.
pub const APIKEY_TTL_SECS: u64 = 3600;

pub fn latest_key(device_id: Uuid, slot: i32) -> String {
    format!("latest:device:{device_id}:slot:{slot}")
}

pub fn latest_prefix(device_id: Uuid) -> String {
    format!("latest:device:{device_id}:slot:")
}

pub fn claim_secret_key(device_id: &str) -> String {
    format!("claim:{device_id}:secret")
}

pub fn apikey_key(raw_key: &str) -> String {
    format!("apikey:valid:{raw_key}")
}

pub fn blacklist_key(jti: &str) -> String {
    format!("jwt:blacklist:{jti}")
}

pub fn auth_rate_key(client_ip: &str) -> String {
    format!("rl:auth:{client_ip}")
}

/// Typed wrapper over the shared Redis connection.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    /// Connect and ping; the caller decides whether a failure is fatal.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async(&mut conn).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.set(key, value).await
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl_secs).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    /// Atomic read-and-delete, used for the single-use secret escrow.
    pub async fn get_del(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("GETDEL").arg(key).query_async(&mut conn).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl_secs).await
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.ttl(key).await
    }

    /// Collect all keys under a prefix (SCAN, no blocking KEYS).
    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Run a prepared script against the shared connection.
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, redis::RedisError> {
        let mut conn = self.conn.clone();
        invocation.invoke_async(&mut conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_builders_match_wire_schema() {
        let device: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        assert_eq!(
            latest_key(device, 7),
            "latest:device:11111111-1111-1111-1111-111111111111:slot:7"
        );
        assert_eq!(
            claim_secret_key("11111111-1111-1111-1111-111111111111"),
            "claim:11111111-1111-1111-1111-111111111111:secret"
        );
        assert_eq!(apikey_key("raw-key"), "apikey:valid:raw-key");
        assert_eq!(blacklist_key("jti-1"), "jwt:blacklist:jti-1");
        assert_eq!(auth_rate_key("10.0.0.1"), "rl:auth:10.0.0.1");
    }
}
