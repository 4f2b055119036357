use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub lock: LockConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Redis endpoint of the coordination store
    pub redis_url: String,
    /// Lease duration granted on every acquire (seconds)
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
    /// Upper bound for a single lock-store call (milliseconds)
    #[serde(default = "default_lock_op_timeout")]
    pub op_timeout_ms: u64,
    /// Prefix prepended to the agent identity to form the lock name
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_lock_op_timeout() -> u64 {
    5000
}

fn default_key_prefix() -> String {
    "agent-lock:".to_string()
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Interval between recovery passes (default: 5 minutes)
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
    /// One-time delay before the first recovery pass after boot
    #[serde(default = "default_recovery_startup_delay")]
    pub recovery_startup_delay_secs: u64,
    /// Interval between position polls
    #[serde(default = "default_position_monitor_interval")]
    pub position_monitor_interval_secs: u64,
    /// Interval between metrics reports
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
    /// Upper bound on waiting for workers during shutdown
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// Interval between decision ticks of a running agent
    #[serde(default = "default_agent_tick_interval")]
    pub agent_tick_interval_secs: u64,
    /// Upper bound for a single exchange read made by a worker
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
}

fn default_recovery_interval() -> u64 {
    300
}

fn default_recovery_startup_delay() -> u64 {
    30
}

fn default_position_monitor_interval() -> u64 {
    15
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_agent_tick_interval() -> u64 {
    60
}

fn default_exchange_timeout() -> u64 {
    10
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            recovery_interval_secs: default_recovery_interval(),
            recovery_startup_delay_secs: default_recovery_startup_delay(),
            position_monitor_interval_secs: default_position_monitor_interval(),
            metrics_interval_secs: default_metrics_interval(),
            stop_timeout_secs: default_stop_timeout(),
            agent_tick_interval_secs: default_agent_tick_interval(),
            exchange_timeout_secs: default_exchange_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Buffer length that triggers an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum time a record waits in the buffer (milliseconds)
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
    /// Upper bound for a single sink call (seconds)
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_secs: u64,
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_wait() -> u64 {
    5000
}

fn default_flush_timeout() -> u64 {
    30
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait(),
            flush_timeout_secs: default_flush_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Consecutive losing trades that open the breaker
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Realized daily loss, in percent of initial balance, that opens the breaker
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    /// How long an opened breaker blocks trading
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> Decimal {
    Decimal::from(5)
}

fn default_cooldown() -> u64 {
    3600
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: default_max_consecutive_losses(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_reflection_timeout")]
    pub timeout_secs: u64,
}

fn default_reflection_timeout() -> u64 {
    30
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_reflection_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file (disabled when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("lock.ttl_secs", 30)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FLEET_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (FLEET__LOCK__REDIS_URL, etc.)
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a configuration with every default filled in
    pub fn default_config(redis_url: &str, database_url: &str) -> Self {
        Self {
            lock: LockConfig {
                redis_url: redis_url.to_string(),
                ttl_secs: default_lock_ttl(),
                op_timeout_ms: default_lock_op_timeout(),
                key_prefix: default_key_prefix(),
            },
            workers: WorkersConfig::default(),
            batch: BatchConfig::default(),
            risk: RiskConfig::default(),
            reflection: ReflectionConfig::default(),
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: default_max_connections(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.lock.ttl_secs == 0 {
            errors.push("lock.ttl_secs must be positive".to_string());
        }

        if self.lock.op_timeout_ms == 0 {
            errors.push("lock.op_timeout_ms must be positive".to_string());
        }

        // Renewal fires at 2/3 of the ttl; a store call must fit inside that window.
        if self.lock.op_timeout_ms.saturating_mul(3) >= self.lock.ttl_secs.saturating_mul(2000) {
            errors.push("lock.op_timeout_ms must be shorter than 2/3 of lock.ttl_secs".to_string());
        }

        if self.batch.max_batch_size == 0 {
            errors.push("batch.max_batch_size must be positive".to_string());
        }

        if self.batch.max_wait_ms == 0 {
            errors.push("batch.max_wait_ms must be positive".to_string());
        }

        if self.risk.max_consecutive_losses == 0 {
            errors.push("risk.max_consecutive_losses must be positive".to_string());
        }

        if self.risk.max_daily_loss_pct <= Decimal::ZERO {
            errors.push("risk.max_daily_loss_pct must be positive".to_string());
        }

        for (name, value) in [
            ("workers.recovery_interval_secs", self.workers.recovery_interval_secs),
            (
                "workers.position_monitor_interval_secs",
                self.workers.position_monitor_interval_secs,
            ),
            ("workers.metrics_interval_secs", self.workers.metrics_interval_secs),
            ("workers.agent_tick_interval_secs", self.workers.agent_tick_interval_secs),
            ("workers.exchange_timeout_secs", self.workers.exchange_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config("redis://localhost", "postgres://localhost/fleet");
        assert!(config.validate().is_ok());
        assert_eq!(config.lock.ttl(), Duration::from_secs(30));
        assert_eq!(config.workers.recovery_startup_delay_secs, 30);
        assert_eq!(config.risk.max_daily_loss_pct, dec!(5));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default_config("redis://localhost", "postgres://localhost/fleet");
        config.lock.ttl_secs = 0;
        config.batch.max_batch_size = 0;
        config.risk.max_daily_loss_pct = dec!(0);

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("lock.ttl_secs")));
        assert!(errors.iter().any(|e| e.contains("max_batch_size")));
        assert!(errors.iter().any(|e| e.contains("max_daily_loss_pct")));
    }

    #[test]
    fn test_op_timeout_must_fit_renewal_window() {
        let mut config = AppConfig::default_config("redis://localhost", "postgres://localhost/fleet");
        config.lock.ttl_secs = 3;
        config.lock.op_timeout_ms = 2500;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("2/3")));
    }

    #[test]
    fn test_extreme_lock_values_do_not_overflow() {
        let mut config = AppConfig::default_config("redis://localhost", "postgres://localhost/fleet");
        config.lock.ttl_secs = u64::MAX;
        config.lock.op_timeout_ms = u64::MAX;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("2/3")));

        config.lock.op_timeout_ms = 50;
        assert!(config.validate().is_ok());
    }
}
