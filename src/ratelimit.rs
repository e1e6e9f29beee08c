//! Distributed rate limiting
//!
//! Fixed-window counters shared across instances through the cache plane.
//! One script increments the per-second, per-minute and per-slot windows in
//! a single round trip, arming each key's expiry on first increment. A
//! request is allowed only when all three counters stay within their
//! limits; there is no rollback on denial.

use redis::Script;

use crate::cache::Cache;
use crate::config::Config;

const WINDOW_SCRIPT: &str = r#"
local keys = KEYS
local expiries = ARGV
local counts = {}
for i = 1, #keys do
  local c = redis.call('INCR', keys[i])
  if c == 1 then
    redis.call('EXPIRE', keys[i], tonumber(expiries[i]))
  end
  counts[i] = c
end
return counts
"#;

/// Outcome of a limiter check. A denial carries the window length of the
/// tightest exceeded limit, surfaced to the client as `Retry-After`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { retry_after_secs: i64 },
}

/// Per-device ingest limiter.
pub struct IngestLimiter {
    cache: Cache,
    script: Script,
    device_per_sec: i64,
    device_per_min: i64,
    slot_per_min: i64,
    fail_open: bool,
}

impl IngestLimiter {
    pub fn new(cache: Cache, config: &Config) -> Self {
        Self {
            cache,
            script: Script::new(WINDOW_SCRIPT),
            device_per_sec: config.rate_limit_device_per_sec,
            device_per_min: config.rate_limit_device_per_min,
            slot_per_min: config.rate_limit_slot_per_min,
            fail_open: config.rate_limit_fail_open,
        }
    }

    /// Whether cache failures should admit traffic.
    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Increment all three windows and evaluate the limits.
    pub async fn allow(&self, device: &str, slot: i32) -> Result<Decision, redis::RedisError> {
        let key_dev_sec = format!("rl:dev:{device}:1");
        let key_dev_min = format!("rl:dev:{device}:60");
        let key_slot_min = format!("rl:dev:{device}:slot:{slot}:60");

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(key_dev_sec)
            .key(key_dev_min)
            .key(key_slot_min)
            .arg(1)
            .arg(60)
            .arg(60);
        let counts: Vec<i64> = self.cache.run_script(&invocation).await?;

        if counts.len() != 3 {
            return Err(redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "invalid rate limit response",
            )));
        }

        if counts[0] > self.device_per_sec {
            return Ok(Decision::Denied {
                retry_after_secs: 1,
            });
        }
        if counts[1] > self.device_per_min || counts[2] > self.slot_per_min {
            return Ok(Decision::Denied {
                retry_after_secs: 60,
            });
        }
        Ok(Decision::Allowed)
    }
}

/// Per-IP limiter for authentication endpoints.
pub struct AuthLimiter {
    pub max_attempts: i64,
    pub window_secs: i64,
}

impl AuthLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            max_attempts: config.rate_limit_auth_max_attempts,
            window_secs: config.rate_limit_auth_window_secs,
        }
    }

    /// Count one attempt for the client IP; returns the remaining TTL when
    /// the attempt pushed the counter over the limit.
    pub async fn check(
        &self,
        cache: &Cache,
        client_ip: &str,
    ) -> Result<Option<i64>, redis::RedisError> {
        let key = crate::cache::auth_rate_key(client_ip);
        let count = cache.incr(&key).await?;
        if count == 1 {
            cache.expire(&key, self.window_secs).await?;
        }
        if count > self.max_attempts {
            let ttl = cache.ttl(&key).await.unwrap_or(self.window_secs);
            return Ok(Some(ttl.max(0)));
        }
        Ok(None)
    }
}
