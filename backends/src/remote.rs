use crate::policy::RemotePolicy;
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use revsnap_core::{Backend, BackendType, Error, Result};
use tracing::{debug, info, warn};

/// Objects at least this large are uploaded in parts.
const MULTIPART_THRESHOLD: usize = 64 * 1024 * 1024;
const PART_SIZE: usize = 16 * 1024 * 1024;

fn backend_error(action: &str, path: &str, err: impl std::error::Error) -> Error {
    Error::Backend(format!("Failed to {} {}: {}", action, path, DisplayErrorContext(err)))
}

/// Backend on an S3-compatible object store.
pub struct RemoteBackend {
    client: Client,
    bucket: String,
    prefix: String,
    retry: RetryConfig,
}

impl RemoteBackend {
    pub async fn new(policy: &RemotePolicy, retry: RetryConfig) -> Result<Self> {
        policy.validate()?;
        let credentials = Credentials::new(&policy.login, &policy.password, None, None, "revsnap");
        let config = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(policy.region.clone()))
            .endpoint_url(policy.endpoint())
            .force_path_style(policy.passive)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket: policy.bucket().to_string(),
            prefix: policy.prefix(),
            retry,
        })
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn relative_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            return key.to_string();
        }
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
            .to_string()
    }

    async fn put_whole(&self, path: &str, key: &str, data: &Bytes) -> Result<()> {
        let client = &self.client;
        let bucket = &self.bucket;
        retry_with_backoff(&self.retry, "put_object", || async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| backend_error("write", path, e))
        })
        .await?;
        Ok(())
    }

    async fn put_multipart(&self, path: &str, key: &str, data: &Bytes) -> Result<()> {
        let client = &self.client;
        let bucket = &self.bucket;
        let created = retry_with_backoff(&self.retry, "create_multipart_upload", || async move {
            client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| backend_error("start upload of", path, e))
        })
        .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Backend(format!("No upload id returned for {}", path)))?
            .to_string();

        match self.upload_parts(path, key, &upload_id, data).await {
            Ok(parts) => {
                let upload = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
                let upload_id = upload_id.as_str();
                let upload = &upload;
                retry_with_backoff(&self.retry, "complete_multipart_upload", || async move {
                    client
                        .complete_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .multipart_upload(upload.clone())
                        .send()
                        .await
                        .map_err(|e| backend_error("complete upload of", path, e))
                })
                .await?;
                Ok(())
            }
            Err(e) => {
                let aborted = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort) = aborted {
                    warn!(path, error = %DisplayErrorContext(abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, path: &str, key: &str, upload_id: &str, data: &Bytes) -> Result<Vec<CompletedPart>> {
        let client = &self.client;
        let bucket = &self.bucket;
        let mut parts = Vec::new();
        for (index, start) in (0..data.len()).step_by(PART_SIZE).enumerate() {
            let part_number = index as i32 + 1;
            let chunk = data.slice(start..(start + PART_SIZE).min(data.len()));
            let chunk = &chunk;
            let uploaded = retry_with_backoff(&self.retry, "upload_part", || async move {
                client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk.clone()))
                    .send()
                    .await
                    .map_err(|e| backend_error("upload part of", path, e))
            })
            .await?;
            debug!(path, part_number, size = chunk.len(), "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn init(&self) -> Result<()> {
        let client = &self.client;
        let bucket = &self.bucket;
        let reachable = retry_with_backoff(&RetryConfig::quick(), "head_bucket", || async move {
            client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| backend_error("reach bucket", bucket, e))
        })
        .await;

        if let Err(e) = reachable {
            info!(bucket = %self.bucket, error = %e, "Bucket not reachable, trying to create it");
            client
                .create_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| backend_error("create bucket", bucket, e))?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => match e.into_service_error() {
                HeadObjectError::NotFound(_) => Ok(false),
                other => Err(backend_error("check", path, other)),
            },
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let client = &self.client;
        let bucket = &self.bucket;
        let key = &self.full_key(path);
        retry_with_backoff(&self.retry, "get_object", || async move {
            let response = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| backend_error("read", path, e))?;
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| backend_error("read body of", path, e))?;
            Ok(data.into_bytes())
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let key = self.full_key(path);
        if data.len() >= MULTIPART_THRESHOLD {
            self.put_multipart(path, &key, &data).await
        } else {
            self.put_whole(path, &key, &data).await
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let client = &self.client;
        let bucket = &self.bucket;
        let key = &self.full_key(path);
        retry_with_backoff(&self.retry, "delete_object", || async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| backend_error("delete", path, e))
        })
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let client = &self.client;
            let bucket = &self.bucket;
            let full_prefix = &full_prefix;
            let token = continuation_token.as_deref();
            let response = retry_with_backoff(&self.retry, "list_objects_v2", || async move {
                client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(full_prefix)
                    .set_continuation_token(token.map(str::to_string))
                    .send()
                    .await
                    .map_err(|e| backend_error("list", prefix, e))
            })
            .await?;

            results.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| self.relative_key(key)),
            );

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(next.to_string());
                }
                _ => break,
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Remote
    }
}
