use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string (broker queues + delivery status)
    pub redis_url: String,

    /// Port the gateway listens on (default: 8001)
    pub gateway_port: u16,

    /// Consecutive failures before a dependency's circuit opens (default: 5)
    pub breaker_max_failures: u32,

    /// Seconds an open circuit waits before probing (default: 30)
    pub breaker_reset_timeout_secs: u64,

    /// Successful probes required to close a half-open circuit (default: 3)
    pub breaker_half_open_probes: u32,

    /// Delivery attempts before a message is dead-lettered (default: 3)
    pub max_retries: u32,

    /// Maximum ready messages per primary queue (default: 10000)
    pub queue_max_length: usize,

    /// Maximum unacknowledged deliveries per consumer (default: 10)
    pub consumer_prefetch: usize,

    /// Sleep between polls of an empty queue in milliseconds (default: 250)
    pub consumer_poll_interval_ms: u64,

    /// How long delivery status records are kept, in seconds (default: 7 days)
    pub status_ttl_secs: u64,

    /// Webhook endpoint for email delivery; simulated delivery when unset
    pub email_webhook_url: Option<String>,

    /// Webhook endpoint for push delivery; simulated delivery when unset
    pub push_webhook_url: Option<String>,

    /// Timeout for a single provider call in milliseconds (default: 5000)
    pub provider_timeout_ms: u64,

    /// Log and remove dead letters as they arrive (default: false, dead
    /// letters are kept for inspection and replay)
    pub dlq_monitor_enabled: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            gateway_port: parse_var("GATEWAY_PORT", "8001")?,
            breaker_max_failures: parse_var("BREAKER_MAX_FAILURES", "5")?,
            breaker_reset_timeout_secs: parse_var("BREAKER_RESET_TIMEOUT_SECS", "30")?,
            breaker_half_open_probes: parse_var("BREAKER_HALF_OPEN_PROBES", "3")?,
            max_retries: parse_var("MAX_RETRIES", "3")?,
            queue_max_length: parse_var("QUEUE_MAX_LENGTH", "10000")?,
            consumer_prefetch: parse_var("CONSUMER_PREFETCH", "10")?,
            consumer_poll_interval_ms: parse_var("CONSUMER_POLL_INTERVAL_MS", "250")?,
            status_ttl_secs: parse_var("STATUS_TTL_SECS", "604800")?,
            email_webhook_url: std::env::var("EMAIL_WEBHOOK_URL").ok(),
            push_webhook_url: std::env::var("PUSH_WEBHOOK_URL").ok(),
            provider_timeout_ms: parse_var("PROVIDER_TIMEOUT_MS", "5000")?,
            dlq_monitor_enabled: parse_var("DLQ_MONITOR_ENABLED", "false")?,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            gateway_port: 8001,
            breaker_max_failures: 5,
            breaker_reset_timeout_secs: 30,
            breaker_half_open_probes: 3,
            max_retries: 3,
            queue_max_length: 10_000,
            consumer_prefetch: 10,
            consumer_poll_interval_ms: 250,
            status_ttl_secs: 604_800,
            email_webhook_url: None,
            push_webhook_url: None,
            provider_timeout_ms: 5_000,
            dlq_monitor_enabled: false,
        }
    }
}

/// Read an environment variable, falling back to `default`, and parse it.
fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}
