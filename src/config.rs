use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Upper bound on a whole HTTP request; external calls carry their own, shorter timeouts.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Payment gateway collaborator settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Base URL of the gateway REST API
    #[serde(default = "default_gateway_base_url")]
    pub gateway_base_url: String,
    /// API key id (basic-auth user)
    #[serde(default)]
    pub key_id: String,
    /// API key secret; also the HMAC secret for payment signatures
    #[serde(default)]
    pub key_secret: String,
    /// ISO currency code for gateway orders
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(default = "default_external_timeout_secs")]
    /// Must stay below the HTTP request timeout
    #[validate(range(min = 1, max = 50))]
    pub timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            gateway_base_url: default_gateway_base_url(),
            key_id: String::new(),
            key_secret: String::new(),
            currency: default_currency(),
            timeout_secs: default_external_timeout_secs(),
        }
    }
}

/// Carrier API collaborator settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CarrierConfig {
    #[serde(default = "default_carrier_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    /// Registered pickup location name sent with every shipment
    #[serde(default = "default_pickup_location")]
    pub pickup_location: String,
    /// Seller name printed on the shipping label
    #[serde(default = "default_seller_name")]
    pub seller_name: String,
    #[serde(default = "default_external_timeout_secs")]
    /// Must stay below the HTTP request timeout
    #[validate(range(min = 1, max = 50))]
    pub timeout_secs: u64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            base_url: default_carrier_base_url(),
            api_token: String::new(),
            pickup_location: default_pickup_location(),
            seller_name: default_seller_name(),
            timeout_secs: default_external_timeout_secs(),
        }
    }
}

/// Notification channel settings. Without an endpoint notifications are only logged.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// HTTP email relay endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// Recipient of retry-queue progress alerts
    #[serde(default)]
    pub operator_address: Option<String>,
    #[serde(default = "default_external_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_token: None,
            from_address: default_from_address(),
            operator_address: None,
            timeout_secs: default_external_timeout_secs(),
        }
    }
}

/// Retry/dead-letter queue scheduling
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetryQueueConfig {
    #[serde(default = "default_true_bool")]
    pub enabled: bool,
    /// Scheduler wake-up interval
    #[serde(default = "default_retry_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// Jobs claimed per scheduler pass
    #[serde(default = "default_retry_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,
    /// Jobs processed at the same time within a pass
    #[serde(default = "default_retry_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,
    /// Backstop timeout for a single job, independent of the call's own timeout
    #[serde(default = "default_retry_job_timeout_secs")]
    #[validate(range(min = 1))]
    pub job_timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: i32,
    /// Flat delay between attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// A `processing` job locked longer than this is considered abandoned
    #[serde(default = "default_retry_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Succeeded jobs older than this are pruned
    #[serde(default = "default_retry_retention_secs")]
    pub succeeded_retention_secs: u64,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retry_interval_secs(),
            batch_size: default_retry_batch_size(),
            concurrency: default_retry_concurrency(),
            job_timeout_secs: default_retry_job_timeout_secs(),
            max_attempts: default_retry_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            lock_timeout_secs: default_retry_lock_timeout_secs(),
            succeeded_retention_secs: default_retry_retention_secs(),
        }
    }
}

impl RetryQueueConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_secs as i64)
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_secs as i64)
    }

    pub fn succeeded_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.succeeded_retention_secs as i64)
    }
}

/// How public order numbers are sequenced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderNumberStrategy {
    /// Database-side counter per day (single upsert, race-free)
    #[default]
    Atomic,
    /// Read highest existing number for the day and increment (degraded mode)
    Scan,
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrderConfig {
    #[serde(default)]
    pub number_strategy: OrderNumberStrategy,
    /// Inserts attempted with a fresh order number before giving up
    #[serde(default = "default_max_create_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_create_attempts: u32,
    /// A `shipment_creating` claim older than this may be taken over
    #[serde(default = "default_shipment_claim_lease_secs")]
    pub shipment_claim_lease_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            number_strategy: OrderNumberStrategy::Atomic,
            max_create_attempts: default_max_create_attempts(),
            shipment_claim_lease_secs: default_shipment_claim_lease_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
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
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,

    #[serde(default)]
    #[validate]
    pub carrier: CarrierConfig,

    #[serde(default)]
    #[validate]
    pub notifications: NotificationConfig,

    #[serde(default)]
    #[validate]
    pub retry_queue: RetryQueueConfig,

    #[serde(default)]
    #[validate]
    pub orders: OrderConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
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
            payment: PaymentConfig::default(),
            carrier: CarrierConfig::default(),
            notifications: NotificationConfig::default(),
            retry_queue: RetryQueueConfig::default(),
            orders: OrderConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Secrets that production cannot run without.
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.is_production() {
            if self.payment.key_secret.trim().is_empty() {
                let mut err = ValidationError::new("payment_secret_missing");
                err.message = Some("payment.key_secret must be set in production".into());
                errors.add("payment", err);
            }
            if self.carrier.api_token.trim().is_empty() {
                let mut err = ValidationError::new("carrier_token_missing");
                err.message = Some("carrier.api_token must be set in production".into());
                errors.add("carrier", err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
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
fn default_true_bool() -> bool {
    true
}
fn default_currency() -> String {
    "INR".to_string()
}
fn default_external_timeout_secs() -> u64 {
    15
}
fn default_gateway_base_url() -> String {
    "https://api.razorpay.com/v1".to_string()
}
fn default_carrier_base_url() -> String {
    "https://track.delhivery.com".to_string()
}
fn default_pickup_location() -> String {
    "primary-warehouse".to_string()
}
fn default_seller_name() -> String {
    "Storefront".to_string()
}
fn default_from_address() -> String {
    "orders@storefront.local".to_string()
}
fn default_retry_interval_secs() -> u64 {
    30 * 60
}
fn default_retry_batch_size() -> u64 {
    10
}
fn default_retry_concurrency() -> usize {
    3
}
fn default_retry_job_timeout_secs() -> u64 {
    120
}
fn default_retry_max_attempts() -> i32 {
    5
}
fn default_retry_delay_secs() -> u64 {
    15 * 60
}
fn default_retry_lock_timeout_secs() -> u64 {
    15 * 60
}
fn default_retry_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_max_create_attempts() -> u32 {
    3
}
fn default_shipment_claim_lease_secs() -> u64 {
    5 * 60
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_fulfillment={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let builder = fmt().with_env_filter(EnvFilter::new(filter_directive));
    // try_init: tests and embedded callers may already have a subscriber
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
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
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_retry_schedule() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert_eq!(cfg.retry_queue.interval(), Duration::from_secs(1800));
        assert_eq!(cfg.retry_queue.batch_size, 10);
        assert_eq!(cfg.retry_queue.concurrency, 3);
        assert_eq!(cfg.retry_queue.max_attempts, 5);
        assert_eq!(cfg.retry_queue.retry_delay(), chrono::Duration::minutes(15));
        assert_eq!(cfg.orders.max_create_attempts, 3);
        assert_eq!(cfg.orders.number_strategy, OrderNumberStrategy::Atomic);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn production_requires_collaborator_secrets() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "production".into());
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.payment.key_secret = "rzp_secret".into();
        cfg.carrier.api_token = "token".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn external_timeouts_stay_below_request_timeout() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.carrier.timeout_secs = 90;
        assert!(cfg.validate().is_err());

        cfg.carrier.timeout_secs = 50;
        cfg.payment.timeout_secs = 61;
        assert!(cfg.validate().is_err());

        cfg.payment.timeout_secs = 10;
        assert!(cfg.validate().is_ok());
        assert!(cfg.carrier.timeout_secs < REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.log_level = "loud".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_nested_sections() {
        let raw = r#"
            database_url = "postgres://localhost/shop"
            host = "0.0.0.0"
            environment = "staging"

            [retry_queue]
            interval_secs = 60
            max_attempts = 3

            [orders]
            number_strategy = "scan"
        "#;
        let cfg: AppConfig = Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.retry_queue.interval_secs, 60);
        assert_eq!(cfg.retry_queue.max_attempts, 3);
        assert_eq!(cfg.retry_queue.batch_size, 10);
        assert_eq!(cfg.orders.number_strategy, OrderNumberStrategy::Scan);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
