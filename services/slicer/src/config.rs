use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the slicer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local directory backend configuration
    #[serde(default)]
    pub local: LocalConfig,
    /// S3 configuration (required when the s3 backend is selected)
    pub s3: Option<S3Config>,
    /// Decode engine configuration
    #[serde(default)]
    pub decoder: DecoderConfig,
    /// Pipeline limits
    #[serde(default)]
    pub pipeline: PipelineConfig,
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
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which storage backend frames go to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
}

/// Storage configuration shared by both backends
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Keep the uploaded video next to its frames
    #[serde(default)]
    pub persist_source_video: bool,
}

/// Local directory backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Root directory under which label directories are created
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for frame storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix under which label folders live
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upload concurrency limit per upload request
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// First retry delay for a failed upload in milliseconds
    #[serde(default = "default_upload_retry_initial_ms")]
    pub upload_retry_initial_ms: u64,
    /// Give up retrying an upload after this many milliseconds
    #[serde(default = "default_upload_retry_max_elapsed_ms")]
    pub upload_retry_max_elapsed_ms: u64,
}

/// Decode engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    /// Path to the ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Container format of uploaded videos
    #[serde(default = "default_input_format")]
    pub input_format: String,
    /// Sampling rate in frames per second
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Decoded frames buffered ahead of the sink
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

/// Pipeline limits
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound for decoding and persisting one upload in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Slots tried before allocation gives up
    #[serde(default = "default_max_allocation_attempts")]
    pub max_allocation_attempts: u32,
}

/// API configuration for the upload endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "slicer-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_base_path() -> PathBuf {
    PathBuf::from("input_folder")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "input_folder".to_string()
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_upload_retry_initial_ms() -> u64 {
    100
}

fn default_upload_retry_max_elapsed_ms() -> u64 {
    10_000
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_input_format() -> String {
    "webm".to_string()
}

fn default_frame_rate() -> u32 {
    20
}

fn default_frame_buffer() -> usize {
    32
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_allocation_attempts() -> u32 {
    16
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024 // 512MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/slicer").required(false))
            .add_source(config::File::with_name("/etc/slicer/slicer").required(false))
            // Override with environment variables
            // SLICER__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("SLICER")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    /// Load configuration from a TOML document
    pub fn from_toml(document: &str) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml));

        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.backend == StorageBackendKind::S3 {
            let s3 = self
                .s3
                .as_ref()
                .ok_or_else(|| ConfigValidationError::MissingField("s3".to_string()))?;

            if s3.bucket.is_empty() {
                return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
            }
            if s3.upload_concurrency == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "s3.upload_concurrency".to_string(),
                    message: "Concurrency must be greater than 0".to_string(),
                });
            }
            if s3.part_size_bytes == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "s3.part_size_bytes".to_string(),
                    message: "Part size must be greater than 0".to_string(),
                });
            }
        }

        if self.decoder.frame_rate == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "decoder.frame_rate".to_string(),
                message: "Frame rate must be greater than 0".to_string(),
            });
        }

        if self.decoder.input_format.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "decoder.input_format".to_string(),
            ));
        }

        if self.pipeline.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get pipeline timeout as Duration
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.timeout_secs)
    }
}

impl S3Config {
    /// Get first upload retry delay as Duration
    pub fn upload_retry_initial(&self) -> Duration {
        Duration::from_millis(self.upload_retry_initial_ms)
    }

    /// Get upload retry budget as Duration
    pub fn upload_retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.upload_retry_max_elapsed_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            input_format: default_input_format(),
            frame_rate: default_frame_rate(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_allocation_attempts: default_max_allocation_attempts(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
