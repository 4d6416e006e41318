use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Download of a missing object; distinct from every other failure.
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Blob storage boundary. URIs take the form `<scheme>://<bucket>/<path>`.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Store bytes at `path` and return the blob URI.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: Option<String>,
    ) -> Result<String, StorageError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// The URI the store would assign to `path`, without touching it.
    fn uri_for(&self, path: &str) -> String;
}

/// Split `<scheme>://<bucket>/<path>` into bucket and path.
pub fn parse_blob_uri(uri: &str) -> Result<(String, String), StorageError> {
    let (_, rest) = uri
        .split_once("://")
        .ok_or_else(|| StorageError::Other(format!("invalid blob uri: {uri}")))?;
    let (bucket, path) = rest
        .split_once('/')
        .ok_or_else(|| StorageError::Other(format!("blob uri has no path: {uri}")))?;
    if bucket.is_empty() || path.is_empty() {
        return Err(StorageError::Other(format!("invalid blob uri: {uri}")));
    }
    Ok((bucket.to_string(), path.to_string()))
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
    scheme: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            scheme: "s3".to_string(),
        }
    }

    /// Build the production store from configuration. A custom endpoint and
    /// static credentials support MinIO-style deployments; without them the
    /// ambient AWS provider chain applies. Path-style addressing keeps
    /// bucket names out of DNS.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()));

        if let Some(endpoint) = &config.aws_endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        if let (Some(access_key), Some(secret_key)) = (
            config.aws_access_key_id.clone(),
            config.aws_secret_access_key.clone(),
        ) {
            loader = loader
                .credentials_provider(Credentials::new(access_key, secret_key, None, None, "static"));
        }

        let base_config = loader.load().await;
        let s3_config = S3ConfigBuilder::from(&base_config)
            .force_path_style(true)
            .build();

        Ok(Self::new(
            S3Client::from_conf(s3_config),
            config.s3_bucket.clone(),
        ))
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: Option<String>,
    ) -> Result<String, StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .map_err(|err| StorageError::Other(format!("failed to upload object: {err}")))?;

        Ok(self.uri_for(path))
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|service_err| service_err.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(path.to_string())
                } else {
                    StorageError::Other(format!("failed to download object: {err}"))
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Other(format!("failed to read object stream: {err}")))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service_err| service_err.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Other(format!("failed to stat object: {err}")))
                }
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| StorageError::Other(format!("failed to delete object: {err}")))?;
        Ok(())
    }

    fn uri_for(&self, path: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, path)
    }
}
