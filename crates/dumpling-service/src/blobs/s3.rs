use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tokio_util::sync::CancellationToken;

use super::{BlobError, BlobKey, BlobStore, BoxReader};
use crate::config::S3StorageConfig;

/// Stores blobs in an S3 bucket.
///
/// Locators are `s3://<bucket>/<object key>` URLs.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn backend_error<E>(err: E) -> BlobError
where
    E: std::error::Error,
{
    BlobError::Backend(DisplayErrorContext(&err).to_string())
}

impl S3BlobStore {
    pub async fn new(config: &S3StorageConfig) -> Self {
        let mut config_loader =
            aws_config::from_env().region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            tracing::debug!("Using static AWS credentials");
            config_loader = config_loader.credentials_provider(Credentials::from_keys(
                access_key.clone(),
                secret_key.clone(),
                None,
            ));
        }
        if let Some(endpoint_url) = &config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint_url);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            // custom endpoints rarely support virtual-hosted buckets
            .force_path_style(config.endpoint.is_some())
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        }
    }

    fn object_key(&self, key: &BlobKey) -> String {
        format!("{}{}", self.prefix, key.as_path())
    }

    fn locator(&self, object_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, object_key)
    }

    fn parse_locator<'a>(&self, locator: &'a str) -> Result<&'a str, BlobError> {
        locator
            .strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .filter(|(bucket, key)| *bucket == self.bucket && key.starts_with(&self.prefix))
            .map(|(_, key)| key)
            .ok_or_else(|| BlobError::InvalidLocator(locator.to_owned()))
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &BlobKey,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, BlobError> {
        let object_key = self.object_key(key);
        tracing::debug!(bucket = %self.bucket, key = %object_key, "uploading to s3");

        let body = ByteStream::from_path(source).await.map_err(backend_error)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type("application/gzip")
            .body(body)
            .send();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // the upload may have completed on the server side already
                if let Err(err) = self.delete_object(&object_key).await {
                    let dynerr: &dyn std::error::Error = &err;
                    tracing::warn!(error = dynerr, key = %object_key, "failed to clean up cancelled upload");
                }
                Err(BlobError::Cancelled)
            }
            response = request => {
                response.map_err(backend_error)?;
                Ok(self.locator(&object_key))
            }
        }
    }

    async fn get(&self, locator: &str) -> Result<BoxReader, BlobError> {
        let object_key = self.parse_locator(locator)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Box::pin(output.body.into_async_read())),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                Err(BlobError::NotFound)
            }
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match response {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError> {
        // S3 deletes are idempotent and do not report whether the object existed.
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.delete_object(&self.object_key(key)).await?;
        Ok(true)
    }
}
