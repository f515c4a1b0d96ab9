use crate::{Error, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Optional static AWS key, exported to the environment before the
    /// client config loads. Should only be used for local testing
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Object store region. Default "us-east-1"
    #[serde(default = "default_region")]
    pub region: String,
    /// Target bucket for uploaded chunks. Required
    pub bucket: String,
    /// Object key prefix. Default ""
    #[serde(default)]
    pub prefix: String,
    /// Optional api endpoint for S3-compatible stores. Default none
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Root directory for local chunk files, created mode 0700. Default
    /// <OS tmp>/beat_s3
    #[serde(default = "default_temporary_directory")]
    pub temporary_directory: PathBuf,
    /// Chunk rotation interval in seconds. Default 300
    #[serde(default = "default_seconds_per_chunk")]
    pub seconds_per_chunk: u64,
    /// Upload retry budget per chunk, in seconds. Default 1800
    #[serde(default = "default_retry_limit_seconds")]
    pub retry_limit_seconds: u64,
    /// RUST_LOG compatible settings string. Default "s3_sink=info"
    #[serde(default = "default_log")]
    pub log: String,
    /// Optional listen address for the prometheus scrape endpoint. Default
    /// none
    #[serde(default)]
    pub metrics: Option<SocketAddr>,
}

pub fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_temporary_directory() -> PathBuf {
    std::env::temp_dir().join("beat_s3")
}

fn default_seconds_per_chunk() -> u64 {
    300
}

fn default_retry_limit_seconds() -> u64 {
    1800
}

fn default_log() -> String {
    "s3_sink=info".to_string()
}

impl Settings {
    /// Load Settings from a given optional path. Settings can be overriden
    /// with environment variables.
    ///
    /// Environment overrides have the same name as the entries in the
    /// settings file in uppercase and prefixed with "S3SINK__". For example
    /// "S3SINK__BUCKET" will override the bucket setting.
    pub fn new<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(file) = path {
            builder = builder
                .add_source(File::with_name(&file.as_ref().to_string_lossy()).required(false));
        }

        let settings: Self = builder
            .add_source(Environment::with_prefix("S3SINK").separator("__"))
            .build()
            .and_then(|config| config.try_deserialize())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result {
        if self.bucket.is_empty() {
            return Err(Error::invalid_settings("bucket must not be empty"));
        }
        if self.seconds_per_chunk < 1 {
            return Err(Error::invalid_settings(
                "seconds_per_chunk must be a positive integer",
            ));
        }
        Ok(())
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_chunk)
    }

    pub fn retry_limit(&self) -> Duration {
        Duration::from_secs(self.retry_limit_seconds)
    }
}
