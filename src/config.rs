//! Service configuration
//!
//! All settings come from the environment with sane defaults for local
//! development. `validate()` refuses to start with placeholder secrets.

const DEFAULT_JWT_SECRET: &str = "change-this-in-production-please";
const DEFAULT_MASTER_KEY: &str = "change-this-manufacturing-key";

/// Runtime configuration for the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    // PostgreSQL (auth database)
    pub postgres_host: String,
    pub postgres_port: String,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,

    // TimescaleDB (telemetry)
    pub timescale_host: String,
    pub timescale_port: String,
    pub timescale_db: String,
    pub timescale_user: String,
    pub timescale_password: String,

    // Redis
    pub redis_host: String,
    pub redis_port: String,
    pub redis_password: String,

    // JWT
    pub jwt_secret: String,
    pub jwt_access_expiration_secs: i64,
    pub jwt_refresh_expiration_secs: i64,

    // Ingest rate limits (per device)
    pub rate_limit_device_per_min: i64,
    pub rate_limit_device_per_sec: i64,
    pub rate_limit_slot_per_min: i64,
    pub rate_limit_fail_open: bool,

    // Auth endpoint rate limits (per client IP)
    pub rate_limit_auth_max_attempts: i64,
    pub rate_limit_auth_window_secs: i64,

    // Latest-value cache
    pub cache_ttl_seconds: i64,

    // CORS
    pub cors_allowed_origins: String,
    pub cors_allowed_methods: String,
    pub cors_allowed_headers: String,

    // Manufacturing / provisioning
    pub manufacturing_master_key: String,
    pub bootstrap_max_skew_secs: i64,

    // Ops notifications
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    // Server shutdown
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            port: get_env("PORT", "3001").parse().unwrap_or(3001),

            postgres_host: get_env("POSTGRES_HOST", "postgres"),
            postgres_port: get_env("POSTGRES_PORT", "5432"),
            postgres_db: get_env("POSTGRES_DB", "iiot_platform"),
            postgres_user: get_env("POSTGRES_USER", "admin"),
            postgres_password: get_env("POSTGRES_PASSWORD", ""),

            timescale_host: env_or("TIMESCALE_HOST", || get_env("POSTGRES_HOST", "timescaledb")),
            timescale_port: env_or("TIMESCALE_PORT", || get_env("POSTGRES_PORT", "5432")),
            timescale_db: get_env("TIMESCALE_DB", "iiot_telemetry"),
            timescale_user: env_or("TIMESCALE_USER", || get_env("POSTGRES_USER", "admin")),
            timescale_password: env_or("TIMESCALE_PASSWORD", || {
                get_env("POSTGRES_PASSWORD", "")
            }),

            redis_host: get_env("REDIS_HOST", "redis"),
            redis_port: get_env("REDIS_PORT", "6379"),
            redis_password: get_env("REDIS_PASSWORD", ""),

            jwt_secret: get_env("JWT_SECRET", DEFAULT_JWT_SECRET),
            jwt_access_expiration_secs: get_env_i64("JWT_ACCESS_EXPIRATION_SECS", 3600),
            jwt_refresh_expiration_secs: get_env_i64("JWT_REFRESH_EXPIRATION_SECS", 30 * 24 * 3600),

            rate_limit_device_per_min: get_env_i64("RATE_LIMIT_DEVICE_PER_MIN", 12),
            rate_limit_device_per_sec: get_env_i64("RATE_LIMIT_DEVICE_PER_SEC", 5),
            rate_limit_slot_per_min: get_env_i64("RATE_LIMIT_SLOT_PER_MIN", 12),
            rate_limit_fail_open: get_env_bool("RATE_LIMIT_FAIL_OPEN", true),

            rate_limit_auth_max_attempts: get_env_i64("RATE_LIMIT_AUTH_MAX_ATTEMPTS", 10),
            rate_limit_auth_window_secs: get_env_i64("RATE_LIMIT_AUTH_WINDOW_SECS", 60),

            cache_ttl_seconds: get_env_i64("CACHE_TTL_SECONDS", 0),

            cors_allowed_origins: get_env("CORS_ALLOWED_ORIGINS", ""),
            cors_allowed_methods: get_env("CORS_ALLOWED_METHODS", "GET,POST,PUT,PATCH,DELETE,OPTIONS"),
            cors_allowed_headers: get_env("CORS_ALLOWED_HEADERS", "Authorization,Content-Type"),

            manufacturing_master_key: get_env("MANUFACTURING_MASTER_KEY", DEFAULT_MASTER_KEY),
            bootstrap_max_skew_secs: get_env_i64("BOOTSTRAP_MAX_SKEW_SECS", 300),

            telegram_bot_token: get_env("TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: get_env("TELEGRAM_CHAT_ID", ""),

            shutdown_timeout_secs: get_env_i64("SHUTDOWN_TIMEOUT_SECS", 30) as u64,
        }
    }

    /// Reject configurations that would ship placeholder secrets.
    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret.is_empty() || self.jwt_secret == DEFAULT_JWT_SECRET {
            return Err("JWT_SECRET must be set to a non-default value".into());
        }
        if self.manufacturing_master_key.is_empty()
            || self.manufacturing_master_key == DEFAULT_MASTER_KEY
        {
            return Err("MANUFACTURING_MASTER_KEY must be set to a non-default value".into());
        }
        Ok(())
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_db
        )
    }

    pub fn timescale_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.timescale_user,
            self.timescale_password,
            self.timescale_host,
            self.timescale_port,
            self.timescale_db
        )
    }

    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/", self.redis_host, self.redis_port)
        } else {
            format!(
                "redis://:{}@{}:{}/",
                self.redis_password, self.redis_host, self.redis_port
            )
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_or(key: &str, fallback: impl FnOnce() -> String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback(),
    }
}

fn get_env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.jwt_secret = "test-jwt-secret".into();
        cfg.manufacturing_master_key = "test-master-key".into();
        cfg
    }

    #[test]
    fn validate_rejects_default_jwt_secret() {
        let mut cfg = test_config();
        cfg.jwt_secret = DEFAULT_JWT_SECRET.into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_default_master_key() {
        let mut cfg = test_config();
        cfg.manufacturing_master_key = DEFAULT_MASTER_KEY.into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_overridden_secrets() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut cfg = test_config();
        cfg.redis_host = "cache".into();
        cfg.redis_port = "6379".into();
        cfg.redis_password = "".into();
        assert_eq!(cfg.redis_url(), "redis://cache:6379/");
        cfg.redis_password = "s3cret".into();
        assert_eq!(cfg.redis_url(), "redis://:s3cret@cache:6379/");
    }
}
