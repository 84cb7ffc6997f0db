use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_LOCATION_CODE: &str = "default";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB pool: connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB pool: idle timeout (seconds)
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// DB pool: acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Bounded capacity of the event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    // ========== Scheduling ==========
    /// Step between candidate appointment start times, in minutes
    #[serde(default = "default_slot_granularity_minutes")]
    #[validate(range(min = 1, max = 240))]
    pub slot_granularity_minutes: u32,

    // ========== Pricing ==========
    /// Tax rate applied to the discounted subtotal (0.10 = 10%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,

    /// Flat shipping fee charged per order
    #[serde(default = "default_flat_shipping_fee")]
    #[validate(custom = "validate_shipping_fee")]
    pub flat_shipping_fee: Decimal,

    // ========== Inventory ==========
    /// Location used when a caller does not name one
    #[serde(default = "default_location_code")]
    #[validate(length(min = 1, max = 64))]
    pub default_location_code: String,

    /// Reorder threshold given to stock items created by the ledger
    #[serde(default = "default_reorder_threshold")]
    #[validate(range(min = 0))]
    pub default_reorder_threshold: i32,

    /// Attempts made by a ledger primitive before reporting a concurrent modification
    #[serde(default = "default_ledger_max_retries")]
    #[validate(range(min = 1, max = 50))]
    pub ledger_max_retries: u32,

    /// Attempts made to find an unused order number
    #[serde(default = "default_order_number_attempts")]
    #[validate(range(min = 1, max = 50))]
    pub order_number_attempts: u32,

    /// Interval between background reconciliation passes (seconds, 0 disables)
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,
}

impl AppConfig {
    /// Creates a new configuration with defaults for everything but the store and environment
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            slot_granularity_minutes: default_slot_granularity_minutes(),
            tax_rate: default_tax_rate(),
            flat_shipping_fee: default_flat_shipping_fee(),
            default_location_code: default_location_code(),
            default_reorder_threshold: default_reorder_threshold(),
            ledger_max_retries: default_ledger_max_retries(),
            order_number_attempts: default_order_number_attempts(),
            reconciliation_interval_secs: default_reconciliation_interval_secs(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_slot_granularity_minutes() -> u32 {
    15
}
fn default_tax_rate() -> Decimal {
    Decimal::new(10, 2)
}
fn default_flat_shipping_fee() -> Decimal {
    Decimal::new(599, 2)
}
fn default_location_code() -> String {
    DEFAULT_LOCATION_CODE.to_string()
}
fn default_reorder_threshold() -> i32 {
    5
}
fn default_ledger_max_retries() -> u32 {
    5
}
fn default_order_number_attempts() -> u32 {
    5
}
fn default_reconciliation_interval_secs() -> u64 {
    3600
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_shipping_fee(fee: &Decimal) -> Result<(), ValidationError> {
    if fee.is_sign_negative() {
        let mut err = ValidationError::new("flat_shipping_fee");
        err.message = Some("flat_shipping_fee cannot be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("petcare_core={},petcare_worker={},sqlx=warn", level, level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

/// Same as [`load_config`] but reads TOML files from `config_dir`.
pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://petcare.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.toml"), content).unwrap();
        dir
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.slot_granularity_minutes, 15);
        assert_eq!(cfg.tax_rate, dec!(0.10));
        assert_eq!(cfg.flat_shipping_fee, dec!(5.99));
        assert!(!cfg.is_production());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.slot_granularity_minutes = 0;
        cfg.tax_rate = dec!(1.5);
        cfg.log_level = "loud".into();
        let errors = cfg.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("slot_granularity_minutes"));
        assert!(fields.contains_key("tax_rate"));
        assert!(fields.contains_key("log_level"));
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.event_channel_capacity = 0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("event_channel_capacity"));

        cfg.event_channel_capacity = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn loads_values_from_toml() {
        let dir = write_config(
            r#"
            database_url = "sqlite::memory:"
            environment = "test"
            slot_granularity_minutes = 30
            tax_rate = 0.2
            default_location_code = "clinic-a"
            "#,
        );
        let cfg = load_config_from(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.slot_granularity_minutes, 30);
        assert_eq!(cfg.tax_rate, dec!(0.2));
        assert_eq!(cfg.default_location_code, "clinic-a");
        assert_eq!(cfg.ledger_max_retries, 5);
    }

    #[test]
    fn invalid_toml_values_fail_validation() {
        let dir = write_config(
            r#"
            database_url = "sqlite::memory:"
            environment = "test"
            ledger_max_retries = 0
            "#,
        );
        let result = load_config_from(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}
