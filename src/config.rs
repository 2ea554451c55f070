use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ev: EvConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

/// Safety limits applied by the risk calculator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum loss-if-stopped per trade in USD
    pub max_risk_usd: Decimal,
    /// Maximum initial margin per trade in USD
    pub max_margin_usd: Decimal,
    /// Account-level leverage cap (the instrument cap may be lower)
    pub max_leverage: Decimal,
    /// Stops closer than this percent of entry are inside the noise zone
    pub min_stop_distance_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_usd: dec!(20),
            max_margin_usd: dec!(150),
            max_leverage: dec!(10),
            min_stop_distance_pct: dec!(0.1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Offset applied to touch-activated levels (0.005 = 0.5%)
    pub activation_buffer_pct: Decimal,
    /// Tolerance on the sum of entry weights
    pub weight_epsilon: Decimal,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            activation_buffer_pct: dec!(0.005),
            weight_epsilon: dec!(0.01),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Lock time-to-live. Must cover the worst-case locked section;
    /// ladders with several market levels get a longer lease automatically.
    pub lock_ttl_ms: u64,
    /// How long a lock acquisition may wait before reporting contention
    pub lock_wait_ms: u64,
    /// Polling interval for order status in milliseconds
    pub poll_interval_ms: u64,
    /// Market order fill timeout in milliseconds
    pub fill_timeout_ms: u64,
    /// Maximum attempts for a single exchange write
    pub max_retries: u8,
    /// Base delay of the exponential retry backoff
    pub retry_base_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 60_000,
            lock_wait_ms: 250,
            poll_interval_ms: 500,
            fill_timeout_ms: 20_000,
            max_retries: 3,
            retry_base_ms: 100,
        }
    }
}

impl ExecutionConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    /// Exponential backoff: base * 2^attempt
    pub fn retry_delay(&self, attempt: u8) -> Duration {
        Duration::from_millis(self.retry_base_ms * (1u64 << attempt.min(10)))
    }

    /// Total backoff one exchange write can spend retrying
    pub fn retry_budget(&self) -> Duration {
        (0..self.max_retries).map(|a| self.retry_delay(a)).sum()
    }

    /// Worst-case time holding the lock: a full fill timeout per market level,
    /// the retry budget, and one more fill timeout for a panic close.
    pub fn locked_section_budget(&self, market_levels: usize) -> Duration {
        let waits = u32::try_from(market_levels).unwrap_or(u32::MAX).saturating_add(1);
        self.fill_timeout().saturating_mul(waits) + self.retry_budget()
    }

    /// Lease for a ladder: the configured TTL, stretched to the ladder's budget
    pub fn lock_lease(&self, market_levels: usize) -> Duration {
        self.lock_ttl().max(self.locked_section_budget(market_levels))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between supervision cycles (seconds)
    pub interval_secs: u64,
    /// Upper bound on skipped cycles after repeated read failures
    pub max_backoff_cycles: u32,
    /// Post-stop sampling horizons (seconds)
    pub post_stop_short_secs: u64,
    pub post_stop_long_secs: u64,
    #[serde(default)]
    pub breakeven: BreakevenConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            max_backoff_cycles: 8,
            post_stop_short_secs: 3_600,
            post_stop_long_secs: 14_400,
            breakeven: BreakevenConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakevenConfig {
    pub enabled: bool,
    /// Target index (1-based) whose fill arms the breakeven move
    pub after_target: usize,
    /// Fee allowance added beyond entry (0.001 = 0.1%)
    pub fee_buffer_pct: Decimal,
    /// Minimum fraction of the peak size that must already be closed
    pub min_closed_fraction: Decimal,
}

impl Default for BreakevenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            after_target: 1,
            fee_buffer_pct: Decimal::ZERO,
            min_closed_fraction: dec!(0.2),
        }
    }
}

/// Expected-value gate thresholds (R multiples)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvConfig {
    pub min_sample: u64,
    pub disable_threshold: Decimal,
    pub rolling_window: usize,
    pub rolling_disable_threshold: Decimal,
    pub warn_threshold: Decimal,
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            min_sample: 20,
            disable_threshold: dec!(-0.15),
            rolling_window: 10,
            rolling_disable_threshold: dec!(-0.10),
            warn_threshold: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file; console only when unset
    #[serde(default)]
    pub dir: Option<String>,
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

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DryRunConfig {
    /// Route orders to the in-memory paper exchange
    pub enabled: bool,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            planner: PlannerConfig::default(),
            execution: ExecutionConfig::default(),
            monitor: MonitorConfig::default(),
            ev: EvConfig::default(),
            logging: LoggingConfig::default(),
            dry_run: DryRunConfig::default(),
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
            .set_default("dry_run.enabled", true)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("RISKON_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // RISKON_RISK__MAX_RISK_USD, RISKON_EXECUTION__FILL_TIMEOUT_MS, ...
            .add_source(
                Environment::with_prefix("RISKON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.risk.max_risk_usd <= Decimal::ZERO {
            errors.push("risk.max_risk_usd must be positive".to_string());
        }
        if self.risk.max_margin_usd <= Decimal::ZERO {
            errors.push("risk.max_margin_usd must be positive".to_string());
        }
        if self.risk.max_leverage < Decimal::ONE {
            errors.push("risk.max_leverage must be at least 1".to_string());
        }
        if self.risk.min_stop_distance_pct < Decimal::ZERO {
            errors.push("risk.min_stop_distance_pct must not be negative".to_string());
        }

        if self.planner.activation_buffer_pct < Decimal::ZERO
            || self.planner.activation_buffer_pct >= Decimal::ONE
        {
            errors.push("planner.activation_buffer_pct must be between 0 and 1".to_string());
        }
        if self.planner.weight_epsilon <= Decimal::ZERO {
            errors.push("planner.weight_epsilon must be positive".to_string());
        }

        let exec = &self.execution;
        if exec.poll_interval_ms == 0 || exec.poll_interval_ms >= exec.fill_timeout_ms {
            errors.push("execution.poll_interval_ms must be positive and below fill_timeout_ms".to_string());
        }
        if exec.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }
        if exec.lock_ttl_ms == 0 || exec.lock_wait_ms == 0 {
            errors.push("execution lock ttl and wait must be positive".to_string());
        }
        let budget = exec.locked_section_budget(1);
        if exec.lock_ttl() < budget {
            errors.push(format!(
                "execution.lock_ttl_ms ({}) is shorter than a single-entry locked section ({}ms: fill timeout, retries, panic close)",
                exec.lock_ttl_ms,
                budget.as_millis()
            ));
        }

        if self.monitor.interval_secs == 0 {
            errors.push("monitor.interval_secs must be positive".to_string());
        }
        if self.monitor.post_stop_short_secs >= self.monitor.post_stop_long_secs {
            errors.push("monitor.post_stop_short_secs must be below post_stop_long_secs".to_string());
        }
        if self.monitor.breakeven.after_target == 0 {
            errors.push("monitor.breakeven.after_target is 1-based".to_string());
        }

        if self.ev.disable_threshold >= Decimal::ZERO
            || self.ev.rolling_disable_threshold >= Decimal::ZERO
        {
            errors.push("ev disable thresholds must be negative".to_string());
        }
        if self.ev.rolling_window == 0 {
            errors.push("ev.rolling_window must be positive".to_string());
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

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.monitor.interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default();
        config.risk.max_risk_usd = Decimal::ZERO;
        config.execution.poll_interval_ms = 30_000;
        config.ev.disable_threshold = dec!(0.1);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.retry_delay(1), Duration::from_millis(200));
        assert_eq!(exec.retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_lock_ttl_must_cover_locked_section() {
        let mut config = AppConfig::default();
        // 20s fill + 20s panic close + 100 + 200 + 400ms of retries
        assert_eq!(config.execution.locked_section_budget(1), Duration::from_millis(40_700));

        config.execution.lock_ttl_ms = 20_000;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("lock_ttl_ms"));

        config.execution.lock_ttl_ms = 40_700;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lock_lease_grows_with_market_levels() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.lock_lease(1), Duration::from_secs(60));
        assert_eq!(exec.lock_lease(3), Duration::from_millis(80_700));
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/riskon-config").unwrap();
        assert_eq!(config.risk.max_risk_usd, dec!(20));
        assert_eq!(config.ev.min_sample, 20);
    }
}
