//! Amazon S3 (and S3-compatible) backend.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use dray_types::BlobLocation;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelFlag;
use crate::error::{StoreError, StoreResult};
use crate::files;
use crate::traits::{BlobStore, ObjectInfo};

/// Region used when the address does not name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Multipart part size. S3 rejects parts under 5 MiB except the last.
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Connection options for [`S3BlobStore`].
#[derive(Clone, Debug)]
pub struct S3Options {
    /// Bucket plus optional key prefix.
    pub location: BlobLocation,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services such as MinIO.
    pub endpoint_url: Option<String>,
    /// Files larger than this are uploaded with multipart upload.
    pub part_size: u64,
}

impl S3Options {
    pub fn new(location: BlobLocation) -> Self {
        Self {
            location,
            region: None,
            endpoint_url: None,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

/// S3 bucket backend. Credentials come from the standard AWS provider chain.
pub struct S3BlobStore {
    client: S3Client,
    location: BlobLocation,
    part_size: u64,
}

impl S3BlobStore {
    /// Build a client from the environment and `options`.
    pub async fn connect(options: S3Options) -> Self {
        let region = options
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;

        let s3_config = match &options.endpoint_url {
            Some(endpoint) => aws_sdk_s3::config::Builder::from(&shared)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build(),
            None => aws_sdk_s3::config::Builder::from(&shared).build(),
        };

        Self::with_client(S3Client::from_conf(s3_config), options)
    }

    /// Wrap a pre-configured client.
    pub fn with_client(client: S3Client, options: S3Options) -> Self {
        Self {
            client,
            location: options.location,
            part_size: options.part_size.max(5 * 1024 * 1024),
        }
    }

    fn bucket(&self) -> &str {
        &self.location.container
    }

    fn sdk_error<E, R>(&self, op: &'static str, path: &str, err: SdkError<E, R>) -> StoreError
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        let unreachable = matches!(
            err,
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
        );
        let reason = DisplayErrorContext(&err).to_string();
        if unreachable {
            StoreError::Connectivity {
                backend: self.describe(),
                reason,
            }
        } else {
            StoreError::request(op, path, reason)
        }
    }

    async fn put_multipart(
        &self,
        key: &str,
        src: &Path,
        size: u64,
        cancel: &CancelFlag,
    ) -> StoreResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await
            .map_err(|e| self.sdk_error("create multipart upload", key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::request("create multipart upload", key, "no upload id"))?
            .to_string();

        info!(key, size, part_size = self.part_size, "starting multipart upload");

        match self.upload_parts(key, &upload_id, src, cancel).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(self.bucket())
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| self.sdk_error("complete multipart upload", key, e))?;
                Ok(())
            }
            Err(err) => {
                // Uncompleted uploads are never visible, but they are billed.
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(self.bucket())
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort), "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        src: &Path,
        cancel: &CancelFlag,
    ) -> StoreResult<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(src).await?;
        let mut buf = vec![0u8; self.part_size as usize];
        let mut parts = Vec::new();

        for part_number in 1.. {
            cancel.check()?;
            let n = files::read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            let response = self
                .client
                .upload_part()
                .bucket(self.bucket())
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf[..n].to_vec()))
                .send()
                .await
                .map_err(|e| self.sdk_error("upload part", key, e))?;
            let etag = response
                .e_tag()
                .ok_or_else(|| StoreError::request("upload part", key, "no ETag returned"))?;
            debug!(key, part_number, bytes = n, "uploaded part");
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
        }

        Ok(parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %self.location))]
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let full_prefix = self.location.key(prefix);
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket())
                .prefix(&full_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| StoreError::List {
                prefix: full_prefix.clone(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if let Some(relative) = self.location.relative(key) {
                    let size = object.size().unwrap_or(0).max(0) as u64;
                    objects.push(ObjectInfo::new(relative, size));
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        debug!(count = objects.len(), "listed S3 objects");
        Ok(objects)
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let key = self.location.key(path);
        match self.client.get_object().bucket(self.bucket()).key(&key).send().await {
            Ok(response) => {
                let data = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::request("get", &key, e))?
                    .into_bytes();
                Ok(Some(data))
            }
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => Ok(None),
            Err(e) => Err(self.sdk_error("get", &key, e)),
        }
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let key = self.location.key(path);
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.sdk_error("put", &key, e))?;
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(bucket = %self.location))]
    async fn put_file(&self, path: &str, src: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        cancel.check()?;
        let key = self.location.key(path);
        let size = tokio::fs::metadata(src).await?.len();

        if size > self.part_size {
            return self.put_multipart(&key, src, size, cancel).await;
        }

        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| StoreError::request("read", &src.display().to_string(), e))?;
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.sdk_error("put", &key, e))?;
        Ok(())
    }

    async fn download(&self, path: &str, dst: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        cancel.check()?;
        let key = self.location.key(path);
        let response = match self.client.get_object().bucket(self.bucket()).key(&key).send().await {
            Ok(response) => response,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(self.sdk_error("get", &key, e)),
        };
        let mut reader = Box::pin(response.body.into_async_read());
        files::copy_atomic(&mut reader, dst, cancel).await?;
        Ok(())
    }

    async fn validate(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(self.bucket())
            .send()
            .await
            .map_err(|e| StoreError::Connectivity {
                backend: self.describe(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("S3(s3://{})", self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_store(location: &str) -> S3BlobStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .build();
        S3BlobStore::with_client(
            S3Client::from_conf(config),
            S3Options::new(BlobLocation::parse(location).unwrap()),
        )
    }

    #[test]
    fn options_builder() {
        let opts = S3Options::new(BlobLocation::new("bucket"))
            .with_region("eu-west-1")
            .with_endpoint_url("http://localhost:9000");
        assert_eq!(opts.region.as_deref(), Some("eu-west-1"));
        assert_eq!(opts.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(opts.part_size, DEFAULT_PART_SIZE);
    }

    #[test]
    fn describe_includes_prefix() {
        let store = offline_store("bucket/team");
        assert_eq!(store.describe(), "S3(s3://bucket/team)");
    }

    #[test]
    fn part_size_respects_s3_minimum() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .build();
        let mut opts = S3Options::new(BlobLocation::new("b"));
        opts.part_size = 1024;
        let store = S3BlobStore::with_client(S3Client::from_conf(config), opts);
        assert_eq!(store.part_size, 5 * 1024 * 1024);
    }
}
