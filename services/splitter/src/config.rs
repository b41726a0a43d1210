use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the splitter service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload engine configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Attachment host configuration
    pub host: HostConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Registry database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Chunked upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Bytes per part. Set this to the host's maximum attachment size.
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Attachments per host message
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long an issued upload token stays usable, in milliseconds
    #[serde(default = "default_token_lifespan_ms")]
    pub token_lifespan_ms: u64,
    /// Largest accepted file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Scratch directory for frames waiting on their batch (memory if unset)
    pub spool_dir: Option<PathBuf>,
    /// How long the issuance trigger waits for an upload to finish
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// Period of the pending upload sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Attachment host backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum HostConfig {
    /// Chat webhook that accepts messages with attachments
    Webhook(WebhookConfig),
    /// S3 bucket, one key prefix per batch
    S3(S3Config),
    /// In-process host, contents are lost on restart
    Memory,
}

/// Webhook host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Full webhook URL including its id and token
    pub url: String,
    /// First retry delay in milliseconds for throttled or failed requests
    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,
    /// Give up retrying a request after this many seconds
    #[serde(default = "default_retry_max_elapsed_secs")]
    pub retry_max_elapsed_secs: u64,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for part storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public origin that serves the bucket's objects
    pub public_base_url: Option<String>,
    /// Key prefix under which batches are written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Public origin of the web app, used in upload and download links
    #[serde(default = "default_webapp_url")]
    pub webapp_url: String,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Shared secret expected in `X-Trigger-Key` on the trigger API
    pub trigger_key: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "splitter-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_url() -> String {
    "sqlite://splitter.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_part_size() -> usize {
    25 * 1024 * 1024 // 25MB
}

fn default_batch_size() -> usize {
    10
}

fn default_token_lifespan_ms() -> u64 {
    24 * 60 * 60 * 1000 // 24 hours
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_completion_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_retry_initial_interval_ms() -> u64 {
    500
}

fn default_retry_max_elapsed_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "attachments".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_webapp_url() -> String {
    "http://localhost:8080".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "splitter-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("host.backend", "memory")?
            // Add config file if present
            .add_source(config::File::with_name("config/splitter").required(false))
            .add_source(config::File::with_name("/etc/splitter/splitter").required(false))
            // Override with environment variables
            // SPLITTER__UPLOAD__PART_SIZE_BYTES -> upload.part_size_bytes
            .add_source(
                config::Environment::with_prefix("SPLITTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the upload engine cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upload.part_size_bytes == 0 {
            anyhow::bail!("upload.part_size_bytes must be greater than zero");
        }
        if self.upload.batch_size == 0 {
            anyhow::bail!("upload.batch_size must be at least 1");
        }
        if self.upload.max_file_size_bytes == 0 {
            anyhow::bail!("upload.max_file_size_bytes must be greater than zero");
        }
        if let HostConfig::Webhook(ref webhook) = self.host {
            if self.upload.batch_size > crate::attachment_host::webhook::MAX_ATTACHMENTS_PER_MESSAGE {
                anyhow::bail!(
                    "upload.batch_size {} exceeds the webhook limit of {} attachments",
                    self.upload.batch_size,
                    crate::attachment_host::webhook::MAX_ATTACHMENTS_PER_MESSAGE
                );
            }
            if webhook.url.is_empty() {
                anyhow::bail!("host.url must be set for the webhook backend");
            }
        }
        Ok(())
    }

    /// Get upload token lifespan as Duration
    pub fn token_lifespan(&self) -> Duration {
        Duration::from_millis(self.upload.token_lifespan_ms)
    }

    /// Get the completion wait of the issuance trigger as Duration
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.completion_timeout_secs)
    }

    /// Get the pending upload sweep period as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.upload.sweep_interval_secs.max(1))
    }
}

impl UploadConfig {
    /// Part size as a non-zero frame size
    pub fn frame_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.part_size_bytes).unwrap_or(NonZeroUsize::MIN)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: default_part_size(),
            batch_size: default_batch_size(),
            token_lifespan_ms: default_token_lifespan_ms(),
            max_file_size_bytes: default_max_file_size(),
            spool_dir: None,
            completion_timeout_secs: default_completion_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            webapp_url: default_webapp_url(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            trigger_key: None,
        }
    }
}
