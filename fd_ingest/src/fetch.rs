use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info};
use shared::ObjectLocation;

use crate::error::{IngestError, IngestResult};

/// Reads whole objects from blob storage.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, location: &ObjectLocation) -> IngestResult<Bytes>;
}

pub struct S3Fetcher {
    client: aws_sdk_s3::Client,
}

impl S3Fetcher {
    /// `endpoint` is the object-storage connection string: the endpoint URL
    /// of the S3-compatible service holding the log containers.
    pub async fn connect(endpoint: &str) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        S3Fetcher {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectFetcher for S3Fetcher {
    async fn fetch(&self, location: &ObjectLocation) -> IngestResult<Bytes> {
        info!("Downloading {}", location);
        let obj = self
            .client
            .get_object()
            .bucket(&location.container)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| {
                error!("Error downloading {}: {}", location, e);
                IngestError::fetch(format!("{}: {}", location, e))
            })?;

        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| IngestError::fetch(format!("{}: {}", location, e)))?;
        Ok(data.into_bytes())
    }
}
