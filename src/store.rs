use crate::{error::AwsError, settings::Settings, Result};
use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use aws_sdk_s3::{primitives::ByteStream, Client};
use futures::TryFutureExt;
use std::path::Path;

/// PutObject capability over an S3-compatible store. The body is the file
/// at `file`, read from offset 0 to EOF. Implementations must be safe for
/// concurrent use across uploaders.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, file: &Path) -> Result;
}

#[derive(Debug, Clone)]
pub struct S3Store {
    bucket: String,
    client: Client,
}

impl S3Store {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        // Static credentials ride the standard env vars so the provider
        // chain picks them up like any other source.
        if let Some(access_key_id) = &settings.access_key_id {
            std::env::set_var("AWS_ACCESS_KEY_ID", access_key_id);
        }
        if let Some(secret_access_key) = &settings.secret_access_key {
            std::env::set_var("AWS_SECRET_ACCESS_KEY", secret_access_key);
        }

        let region = Region::new(settings.region.clone());
        let region_provider = RegionProviderChain::first_try(region).or_default_provider();

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&config);
        if let Some(endpoint) = settings.endpoint.clone() {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            bucket: settings.bucket.clone(),
            client: Client::from_conf(s3_config.build()),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, file: &Path) -> Result {
        let body = ByteStream::from_path(file)
            .await
            .map_err(AwsError::byte_stream_error)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/octet-stream")
            .send()
            .map_ok(|_| ())
            .map_err(AwsError::put_object_error)
            .await
    }
}
