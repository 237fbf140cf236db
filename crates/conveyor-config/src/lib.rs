//! `conveyor.toml` configuration loading.
//!
//! One struct per section, every field with a `default_*()` fallback so a
//! config file only needs to mention what it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use conveyor_storage::StorageType;
use conveyor_webhook::WebhookConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
    #[serde(default = "default_parse_merge_budget_ms")]
    pub parse_merge_budget_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget_ms: default_budget_ms(),
            parse_merge_budget_ms: default_parse_merge_budget_ms(),
        }
    }
}

fn default_budget_ms() -> u64 {
    25_000
}

fn default_parse_merge_budget_ms() -> u64 {
    50_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

fn default_max_retries() -> u32 {
    conveyor_retry::STEP_MAX_RETRIES
}

fn default_jitter_fraction() -> f64 {
    conveyor_retry::DEFAULT_JITTER_FRACTION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_seconds: default_lock_ttl_seconds() }
    }
}

fn default_lock_ttl_seconds() -> u64 {
    120
}

/// String-keyed storage backend selector, translated to
/// [`conveyor_storage::StorageType`] at startup. Only `file` is backed by a
/// real implementation; the others are accepted so a config can name an
/// intended backend without the orchestrator refusing to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    File,
    S3,
    Gcs,
    Azure,
}

impl StorageBackendKind {
    pub fn to_storage_type(self) -> StorageType {
        match self {
            StorageBackendKind::File => StorageType::File,
            StorageBackendKind::S3 => StorageType::S3,
            StorageBackendKind::Gcs => StorageType::Gcs,
            StorageBackendKind::Azure => StorageType::Azure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfigInner {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for StorageBackendKind {
    fn default() -> Self {
        StorageBackendKind::File
    }
}

impl Default for StorageConfigInner {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            base_path: default_base_path(),
        }
    }
}

fn default_base_path() -> String {
    "./conveyor-data".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
    #[serde(
        default = "default_webhook_timeout",
        serialize_with = "conveyor_duration::serialize_duration",
        deserialize_with = "conveyor_duration::deserialize_duration"
    )]
    pub webhook_timeout: Duration,
    #[serde(default = "default_webhook_delivery_attempts")]
    pub webhook_delivery_attempts: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_secret_env: default_webhook_secret_env(),
            webhook_timeout: default_webhook_timeout(),
            webhook_delivery_attempts: default_webhook_delivery_attempts(),
        }
    }
}

fn default_webhook_secret_env() -> String {
    "CONVEYOR_WEBHOOK_SECRET".to_string()
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_webhook_delivery_attempts() -> u32 {
    3
}

impl NotificationConfig {
    /// Build a [`WebhookConfig`], reading the signing secret from the
    /// configured environment variable. A blank `webhook_url` disables
    /// notification delivery.
    pub fn to_webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            enabled: !self.webhook_url.is_empty(),
            url: if self.webhook_url.is_empty() { None } else { Some(self.webhook_url.clone()) },
            secret: std::env::var(&self.webhook_secret_env).ok(),
            timeout: self.webhook_timeout,
            delivery_attempts: self.webhook_delivery_attempts,
        }
    }
}

/// Fee ladder inputs for the `pricing` step. The source read these
/// per-run from an operator-supplied `fee_config` on the step-runner HTTP
/// surface; here they live in `conveyor.toml` so a run doesn't need an
/// external caller to supply them on every invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_shipping")]
    pub shipping: f64,
    #[serde(default = "default_vat_percent")]
    pub vat_percent: f64,
    #[serde(default = "default_fee_drev")]
    pub fee_drev: f64,
    #[serde(default = "default_fee_mkt")]
    pub fee_mkt: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            shipping: default_shipping(),
            vat_percent: default_vat_percent(),
            fee_drev: default_fee_drev(),
            fee_mkt: default_fee_mkt(),
        }
    }
}

fn default_shipping() -> f64 {
    5.0
}
fn default_vat_percent() -> f64 {
    22.0
}
fn default_fee_drev() -> f64 {
    1.0
}
fn default_fee_mkt() -> f64 {
    1.0
}

/// Per-marketplace IT/EU stock-split parameters feeding
/// `resolveMarketplaceStock` in each export step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketplaceStockConfig {
    #[serde(default)]
    pub include_eu: bool,
    #[serde(default = "default_it_prep_days")]
    pub it_prep_days: u32,
    #[serde(default = "default_eu_prep_days")]
    pub eu_prep_days: u32,
}

impl Default for MarketplaceStockConfig {
    fn default() -> Self {
        Self {
            include_eu: true,
            it_prep_days: default_it_prep_days(),
            eu_prep_days: default_eu_prep_days(),
        }
    }
}

fn default_it_prep_days() -> u32 {
    1
}
fn default_eu_prep_days() -> u32 {
    5
}

/// The three marketplace export steps' stock-split configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MarketplaceConfig {
    #[serde(default)]
    pub amazon: MarketplaceStockConfig,
    #[serde(default)]
    pub mediaworld: MarketplaceStockConfig,
    #[serde(default)]
    pub eprice: MarketplaceStockConfig,
}

/// SFTP credential presence is validated by `upload_sftp` but no live SFTP
/// client is implemented here — these name the environment
/// variables the step runner checks for, not the credentials themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpEnvConfig {
    #[serde(default = "default_sftp_host_env")]
    pub host_env: String,
    #[serde(default = "default_sftp_user_env")]
    pub user_env: String,
    #[serde(default = "default_sftp_password_env")]
    pub password_env: String,
    #[serde(default = "default_sftp_base_dir_env")]
    pub base_dir_env: String,
}

impl Default for SftpEnvConfig {
    fn default() -> Self {
        Self {
            host_env: default_sftp_host_env(),
            user_env: default_sftp_user_env(),
            password_env: default_sftp_password_env(),
            base_dir_env: default_sftp_base_dir_env(),
        }
    }
}

fn default_sftp_host_env() -> String {
    "SFTP_HOST".to_string()
}
fn default_sftp_user_env() -> String {
    "SFTP_USER".to_string()
}
fn default_sftp_password_env() -> String {
    "SFTP_PASSWORD".to_string()
}
fn default_sftp_base_dir_env() -> String {
    "SFTP_BASE_DIR".to_string()
}

impl SftpEnvConfig {
    /// Reads the four credential environment variables this config names.
    /// Returns `None` if any is unset — the `upload_sftp` step treats an
    /// incomplete credential set as a permanent configuration failure.
    pub fn read_credentials(&self) -> Option<SftpCredentials> {
        Some(SftpCredentials {
            host: std::env::var(&self.host_env).ok()?,
            user: std::env::var(&self.user_env).ok()?,
            password: std::env::var(&self.password_env).ok()?,
            base_dir: std::env::var(&self.base_dir_env).ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpCredentials {
    pub host: String,
    pub user: String,
    pub password: String,
    pub base_dir: String,
}

/// The full `conveyor.toml` configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConveyorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub storage: StorageConfigInner,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub sftp: SftpEnvConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
}

impl ConveyorConfig {
    /// Load `conveyor.toml` from a working root. Returns the default
    /// configuration if no file is present — absence is not an error.
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let path = root.join("conveyor.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: ConveyorConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.budget_ms == 0 {
            bail!("orchestrator.budget_ms must be greater than 0");
        }
        if self.orchestrator.parse_merge_budget_ms == 0 {
            bail!("orchestrator.parse_merge_budget_ms must be greater than 0");
        }
        if self.lock.ttl_seconds == 0 {
            bail!("lock.ttl_seconds must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            bail!("retry.jitter_fraction must be between 0.0 and 1.0");
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.base_path)
    }
}
