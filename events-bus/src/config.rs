// Event bus configuration, read once from the environment at startup
use crate::error::{EventBusError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Process-wide event bus configuration.
///
/// Read once at startup via [`EventBusConfig::from_env`]; there is no
/// hot-reload contract. A present-but-invalid variable fails fast with a
/// configuration error.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Full broker URL; overrides the host/port/password parts when set
    pub broker_url: String,
    /// Broker database index
    pub broker_db: u32,
    /// Name of this service, stamped as the `source` of published events
    pub service_name: String,
    /// Default handler retry attempts per delivery
    pub default_max_retries: u32,
    /// Default wall-clock bound for one handler invocation
    pub default_handler_timeout: Duration,
    /// Default in-flight handler bound per subscription
    pub default_concurrency: usize,
    /// First retry delay; doubles per attempt, capped at 30 s
    pub retry_backoff_base: Duration,
    /// Whether terminally failed deliveries are persisted
    pub dead_letter_enabled: bool,
    /// Retention for dead-letter records
    pub dead_letter_ttl: Duration,
    /// Upper bound on stored dead-letter records
    pub dead_letter_max_len: u64,
    /// How often the delayed-event scanner polls for due entries
    pub delayed_scan_interval: Duration,
    /// Maximum due entries handled per scan
    pub delayed_scan_batch: usize,
    /// Base delay between broker connect attempts; grows linearly per attempt
    pub connect_base_delay: Duration,
    /// Connect attempts before the connection is reported terminally down
    pub connect_max_attempts: u32,
    /// Bound on graceful shutdown
    pub shutdown_timeout: Duration,
    /// Append every published envelope to a capped audit list
    pub event_store_enabled: bool,
    /// Bound on the audit list when the event store is enabled
    pub event_store_max_len: u64,
    /// Serialized events above this size are rejected
    pub max_event_bytes: usize,
    /// Batch publisher flush threshold
    pub batch_size: usize,
    /// Batch publisher periodic flush interval
    pub batch_flush_interval: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379".to_string(),
            broker_db: 0,
            service_name: "rustcare-engine".to_string(),
            default_max_retries: 3,
            default_handler_timeout: Duration::from_secs(30),
            default_concurrency: 10,
            retry_backoff_base: Duration::from_secs(1),
            dead_letter_enabled: true,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 3600),
            dead_letter_max_len: 10_000,
            delayed_scan_interval: Duration::from_secs(5),
            delayed_scan_batch: 100,
            connect_base_delay: Duration::from_secs(5),
            connect_max_attempts: 10,
            shutdown_timeout: Duration::from_secs(30),
            event_store_enabled: false,
            event_store_max_len: 100_000,
            max_event_bytes: crate::schema::DEFAULT_MAX_EVENT_BYTES,
            batch_size: 100,
            batch_flush_interval: Duration::from_secs(5),
        }
    }
}

impl EventBusConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let broker_url = match std::env::var("EVENT_BUS_REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host =
                    std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port: u16 = env_parse("REDIS_PORT", 6379)?;
                match std::env::var("REDIS_PASSWORD") {
                    Ok(password) if !password.is_empty() => {
                        format!("redis://:{}@{}:{}", password, host, port)
                    }
                    _ => format!("redis://{}:{}", host, port),
                }
            }
        };

        Ok(Self {
            broker_url,
            broker_db: env_parse("REDIS_DB", defaults.broker_db)?,
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| defaults.service_name.clone()),
            default_max_retries: env_parse(
                "EVENT_BUS_MAX_RETRIES",
                defaults.default_max_retries,
            )?,
            default_handler_timeout: env_secs(
                "EVENT_BUS_HANDLER_TIMEOUT_SECS",
                defaults.default_handler_timeout,
            )?,
            default_concurrency: env_parse(
                "EVENT_BUS_HANDLER_CONCURRENCY",
                defaults.default_concurrency,
            )?,
            retry_backoff_base: env_millis(
                "EVENT_BUS_RETRY_BACKOFF_MS",
                defaults.retry_backoff_base,
            )?,
            dead_letter_enabled: env_parse(
                "EVENT_BUS_DEAD_LETTER_ENABLED",
                defaults.dead_letter_enabled,
            )?,
            dead_letter_ttl: env_secs("EVENT_BUS_DEAD_LETTER_TTL_SECS", defaults.dead_letter_ttl)?,
            dead_letter_max_len: env_parse(
                "EVENT_BUS_DEAD_LETTER_MAX_LEN",
                defaults.dead_letter_max_len,
            )?,
            delayed_scan_interval: env_secs(
                "EVENT_BUS_DELAYED_SCAN_INTERVAL_SECS",
                defaults.delayed_scan_interval,
            )?,
            delayed_scan_batch: env_parse(
                "EVENT_BUS_DELAYED_SCAN_BATCH",
                defaults.delayed_scan_batch,
            )?,
            connect_base_delay: env_secs(
                "EVENT_BUS_CONNECT_BASE_DELAY_SECS",
                defaults.connect_base_delay,
            )?,
            connect_max_attempts: env_parse(
                "EVENT_BUS_CONNECT_MAX_ATTEMPTS",
                defaults.connect_max_attempts,
            )?,
            shutdown_timeout: env_secs(
                "EVENT_BUS_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
            event_store_enabled: env_parse(
                "EVENT_BUS_EVENT_STORE_ENABLED",
                defaults.event_store_enabled,
            )?,
            event_store_max_len: env_parse(
                "EVENT_BUS_EVENT_STORE_MAX_LEN",
                defaults.event_store_max_len,
            )?,
            max_event_bytes: env_parse("EVENT_BUS_MAX_EVENT_BYTES", defaults.max_event_bytes)?,
            batch_size: env_parse("EVENT_BUS_BATCH_SIZE", defaults.batch_size)?,
            batch_flush_interval: env_secs(
                "EVENT_BUS_BATCH_FLUSH_INTERVAL_SECS",
                defaults.batch_flush_interval,
            )?,
        })
    }

    /// Connection URL with the database index appended.
    pub fn connection_url(&self) -> String {
        if self.broker_db == 0 {
            self.broker_url.clone()
        } else {
            format!(
                "{}/{}",
                self.broker_url.trim_end_matches('/'),
                self.broker_db
            )
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            EventBusError::ConfigurationError(format!("invalid value for {}: '{}'", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(
        key,
        default.as_secs(),
    )?))
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EventBusConfig::default();
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.default_handler_timeout, Duration::from_secs(30));
        assert_eq!(config.default_concurrency, 10);
        assert!(config.dead_letter_enabled);
        assert_eq!(config.dead_letter_ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.delayed_scan_interval, Duration::from_secs(5));
        assert_eq!(config.connect_base_delay, Duration::from_secs(5));
        assert_eq!(config.connect_max_attempts, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn connection_url_appends_db_index() {
        let mut config = EventBusConfig::default();
        assert_eq!(config.connection_url(), "redis://127.0.0.1:6379");
        config.broker_db = 2;
        assert_eq!(config.connection_url(), "redis://127.0.0.1:6379/2");
    }

    #[test]
    fn invalid_env_value_fails_fast() {
        // Var name unique to this test to avoid cross-test interference.
        std::env::set_var("EVENT_BUS_TEST_BAD_NUMBER", "not-a-number");
        let result: Result<u32> = env_parse("EVENT_BUS_TEST_BAD_NUMBER", 3);
        std::env::remove_var("EVENT_BUS_TEST_BAD_NUMBER");
        assert!(matches!(
            result,
            Err(EventBusError::ConfigurationError(_))
        ));
    }

    #[test]
    fn absent_env_value_uses_default() {
        let value: u32 = env_parse("EVENT_BUS_TEST_ABSENT", 7).expect("default");
        assert_eq!(value, 7);
    }
}
