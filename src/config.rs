use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
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
const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Loyalty programme settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct LoyaltyConfig {
    /// Credit points on completion
    #[serde(default = "default_true_bool")]
    pub enabled: bool,

    /// Money spent per point earned (e.g. 10000 means one point per 10,000)
    #[serde(default = "default_points_per_amount")]
    #[validate(custom = "validate_positive_decimal")]
    pub points_per_amount: Decimal,

    /// Money value of a single redeemed point
    #[serde(default = "default_point_value")]
    #[validate(custom = "validate_positive_decimal")]
    pub point_value: Decimal,
}

impl Default for LoyaltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            points_per_amount: default_points_per_amount(),
            point_value: default_point_value(),
        }
    }
}

/// Shipping carrier integration settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CarrierConfig {
    /// Carrier display name persisted on shipped orders
    #[serde(default = "default_carrier_name")]
    pub name: String,

    /// Carrier API root, e.g. `https://api.carrier.example/v2`
    #[validate(length(min = 1))]
    pub base_url: String,

    /// Token sent in the `Token` header
    #[serde(default)]
    pub api_token: String,

    /// Shared secret for webhook signatures; unsigned webhooks are accepted when unset
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Lifetime of cached province/district/ward lookups
    #[serde(default = "default_address_cache_ttl_secs")]
    #[validate(range(min = 1))]
    pub address_cache_ttl_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_carrier_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            name: default_carrier_name(),
            base_url: "http://localhost:9090".to_string(),
            api_token: String::new(),
            webhook_secret: None,
            address_cache_ttl_secs: default_address_cache_ttl_secs(),
            timeout_secs: default_carrier_timeout_secs(),
        }
    }
}

impl CarrierConfig {
    pub fn address_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.address_cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
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
    #[validate(range(min = 1))]
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

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Maximum shipments created in parallel by a bulk dispatch
    #[serde(default = "default_dispatch_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub dispatch_concurrency: usize,

    #[serde(default)]
    #[validate]
    pub loyalty: LoyaltyConfig,

    #[serde(default)]
    #[validate]
    pub carrier: CarrierConfig,
}

impl AppConfig {
    /// Minimal configuration used by tests and embedded setups.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            dispatch_concurrency: default_dispatch_concurrency(),
            loyalty: LoyaltyConfig::default(),
            carrier: CarrierConfig::default(),
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

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() && self.carrier.webhook_secret.as_deref().unwrap_or("").is_empty()
        {
            let mut err = ValidationError::new("webhook_secret_required");
            err.message = Some(
                "Set APP__CARRIER__WEBHOOK_SECRET so carrier callbacks can be verified in production"
                    .into(),
            );
            errors.add("carrier", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
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
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_dispatch_concurrency() -> usize {
    DEFAULT_DISPATCH_CONCURRENCY
}

fn default_true_bool() -> bool {
    true
}

fn default_points_per_amount() -> Decimal {
    Decimal::from(10_000)
}

fn default_point_value() -> Decimal {
    Decimal::from(1_000)
}

fn default_carrier_name() -> String {
    "ghn".to_string()
}

fn default_address_cache_ttl_secs() -> u64 {
    3600
}

fn default_carrier_timeout_secs() -> u64 {
    15
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

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        let mut err = ValidationError::new("positive");
        err.message = Some("Must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("retail_fulfillment={},tower_http=debug", level);
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

/// Loads `config/default`, then `config/<RUN_ENV>`, then `APP__*` environment overrides.
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
        .set_default("database_url", "sqlite://fulfillment.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("carrier.base_url", "http://localhost:9090")?
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
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
