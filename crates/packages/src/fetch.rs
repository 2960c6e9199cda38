use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{Error, MAX_TOTAL_BYTES};

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Thin client over the S3-compatible package bucket. Cheap to clone and
/// shared across workers.
#[derive(Clone)]
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
}

impl ObjectStore {
    pub fn connect(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "static",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            // MinIO and friends route by path, not by virtual host.
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
        }
    }

    /// Download `bucket/key` into `dest_dir`, returning the archive path
    /// and its size. The caller owns `dest_dir` and its cleanup.
    #[tracing::instrument(skip(self), fields(bucket, key))]
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest_dir: &Path,
    ) -> Result<(PathBuf, u64), Error> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_get_error(err, bucket, key))?;

        if let Some(length) = response.content_length() {
            if length as u64 > MAX_TOTAL_BYTES {
                return Err(Error::PayloadTooLarge {
                    what: "archive",
                    actual: length as u64,
                    limit: MAX_TOTAL_BYTES,
                });
            }
        }

        let archive_path = dest_dir.join("package.tar.gz");
        let mut file = tokio::fs::File::create(&archive_path).await?;
        let mut body = response.body;
        let mut written: u64 = 0;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| Error::StoreUnavailable(err.into()))?
        {
            written += chunk.len() as u64;
            // Content-Length can lie; enforce the cap on actual bytes.
            if written > MAX_TOTAL_BYTES {
                return Err(Error::PayloadTooLarge {
                    what: "archive",
                    actual: written,
                    limit: MAX_TOTAL_BYTES,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(bucket, key, bytes = written, "downloaded package archive");
        Ok((archive_path, written))
    }
}

fn classify_get_error(err: SdkError<GetObjectError>, bucket: &str, key: &str) -> Error {
    match &err {
        SdkError::ServiceError(service) if service.err().is_no_such_key() => Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        _ => Error::StoreUnavailable(err.into()),
    }
}
