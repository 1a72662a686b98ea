use crate::broker::BackoffPolicy;
use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which pub/sub backend carries fan-out traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// Redis Streams, shared by every relay instance
    Redis,
    /// In-process broker; only valid for a single instance
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerBackend::Redis),
            "memory" => Ok(BrokerBackend::Memory),
            other => Err(AppError::Config(format!(
                "BROKER_BACKEND must be 'redis' or 'memory', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis_url: String,
    /// Fanout exchange (Redis stream key)
    pub exchange: String,
    /// Durable queue bound to the exchange (Redis consumer group)
    pub queue: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    /// How long one consume read may block before returning empty
    pub block: Duration,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::Config("BROKER_MAX_ATTEMPTS must be at least 1".into()));
        }
        // a zero block either spins the memory consumer or blocks Redis forever
        if self.block.is_zero() {
            return Err(AppError::Config("BROKER_BLOCK_MS must be at least 1".into()));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_jitter: self.max_jitter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: usize,
    pub port: u16,
    pub jwt_secret: String,
    pub broker: BrokerConfig,
    /// Capacity of each session's outbound queue
    pub session_queue_capacity: usize,
    pub persist_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        if jwt_secret.is_empty() {
            return Err(AppError::Config("JWT_SECRET must not be empty".into()));
        }

        // SERVER_PORT is the legacy name
        let port = match env::var("PORT") {
            Ok(_) => parse_env("PORT", 8080u16)?,
            Err(_) => parse_env("SERVER_PORT", 8080u16)?,
        };

        let backend = match env::var("BROKER_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => BrokerBackend::Redis,
        };

        let broker = BrokerConfig {
            backend,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            exchange: env::var("BROKER_EXCHANGE").unwrap_or_else(|_| "chat_messages".into()),
            queue: env::var("BROKER_QUEUE").unwrap_or_else(|_| "message".into()),
            max_attempts: parse_env("BROKER_MAX_ATTEMPTS", 5u32)?,
            base_delay: Duration::from_millis(parse_env("BROKER_BASE_DELAY_MS", 500u64)?),
            max_jitter: Duration::from_millis(parse_env("BROKER_MAX_JITTER_MS", 250u64)?),
            block: Duration::from_millis(parse_env("BROKER_BLOCK_MS", 5000u64)?),
        };
        broker.validate()?;

        let session_queue_capacity = parse_env("SESSION_QUEUE_CAPACITY", 256usize)?;
        if session_queue_capacity == 0 {
            return Err(AppError::Config(
                "SESSION_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }

        Ok(Self {
            database_url,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 16usize)?,
            port,
            jwt_secret,
            broker,
            session_queue_capacity,
            persist_timeout: Duration::from_millis(parse_env("PERSIST_TIMEOUT_MS", 5000u64)?),
        })
    }
}

/// Reads `key` from the environment, falling back to `default` when unset.
/// A value that is set but unparsable is a configuration error.
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'")))
}
