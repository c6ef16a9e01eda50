use async_trait::async_trait;
use aws_sdk_s3::Client;

use crate::error::LoadError;
use crate::identity::ImageId;

use super::{LoadedImage, Loader};

/// S3-backed loader.
///
/// Identities look like `s3:studies/1.2.3/series/4.5.6/volume.bin`; the
/// locator is the object key inside the configured bucket. Works with any
/// S3-compatible store (MinIO etc.) through [`create_s3_client`].
#[derive(Clone)]
pub struct S3Loader {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Loader {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: None,
        }
    }

    /// Prepend `prefix` to every object key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key_for(&self, id: &ImageId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), id.locator()),
            None => id.locator().to_string(),
        }
    }
}

#[async_trait]
impl Loader for S3Loader {
    async fn load(&self, id: &ImageId) -> Result<LoadedImage, LoadError> {
        let key = self.key_for(id);
        let location = format!("s3://{}/{}", self.bucket, key);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let is_not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);

                let status_is_404 = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);

                if is_not_found || status_is_404 {
                    LoadError::not_found(location.clone())
                } else {
                    LoadError::network(format!("{}: {}", location, e))
                }
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| LoadError::network(format!("{}: {}", location, e)))?
            .into_bytes();

        Ok(LoadedImage::from_bytes(data))
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services usually need path-style addressing
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}
