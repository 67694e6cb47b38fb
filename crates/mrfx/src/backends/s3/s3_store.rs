use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{S3ObjectWriter, S3StoreConfig, bounded, classify_sdk_error};
use crate::backends::{ObjectStore, ObjectWriter, ObjectWriterBackend, classify_io_error};
use crate::errors::AttemptError;
use crate::retry::RetryPolicy;

/// Above this, a single PutObject is refused by S3 and R2 alike.
const SINGLE_PUT_LIMIT: u64 = 5 * 1024 * 1024 * 1024;
/// Read size when streaming a big local file through the multipart writer.
const FILE_READ_CHUNK: usize = 8 * 1024 * 1024;

/// 🪣 A bucket handle. The `Client` is an `Arc` inside, so cloning is cheap.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    timeout: Duration,
    /// The run's policy, handed to every multipart writer this store creates.
    retry: RetryPolicy,
    /// Files above this size go multipart. Only tests move it.
    multipart_threshold: u64,
}

impl S3Store {
    /// 🚀 Build the client from config.
    ///
    /// 1. Region from config (`auto` works for R2 and MinIO)
    /// 2. Static keys if both are configured, otherwise the default AWS chain
    ///    (env vars, profile, IMDS, the whole parade)
    /// 3. Optional custom endpoint + path-style addressing
    /// 4. SDK-level retries off: `retry` is the only policy, so attempts are what the
    ///    config says and not that number times three
    pub async fn new(config: &S3StoreConfig, retry: RetryPolicy) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "mrfx-config",
            ));
        }
        let sdk_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .retry_config(aws_sdk_s3::config::retry::RetryConfig::disabled());
        if let Some(endpoint) = &config.endpoint_url {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let client = Client::from_conf(s3_config.build());

        info!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint_url,
            "🪣 S3 client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            timeout: Duration::from_secs(config.operation_timeout_secs.max(1)),
            retry,
            multipart_threshold: SINGLE_PUT_LIMIT,
        })
    }

    /// 🧪 Send smaller files down the multipart path, so tests don't need 5 GiB of fixture.
    #[cfg(test)]
    pub(crate) fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes;
        self
    }

    /// 🐘 Files past the single-put limit go through the multipart writer in chunks.
    async fn put_large_file(&self, key: &str, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .context(format!("💀 opening '{}' for multipart upload", path.display()))?;
        let mut writer = S3ObjectWriter::new(
            self.client.clone(),
            self.bucket.clone(),
            key.to_string(),
            self.timeout,
            self.retry.clone(),
        );
        let mut chunk = vec![0u8; FILE_READ_CHUNK];
        loop {
            let read = match file.read(&mut chunk).await {
                Ok(read) => read,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e).context(format!("💀 reading '{}'", path.display()));
                }
            };
            if read == 0 {
                break;
            }
            if let Err(e) = writer.write(chunk[..read].to_vec()).await {
                let _ = writer.abort().await;
                return Err(e);
            }
        }
        if let Err(e) = writer.finish().await {
            let _ = writer.abort().await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn open_writer(&self, key: &str, retry: &RetryPolicy) -> Result<ObjectWriterBackend> {
        Ok(ObjectWriterBackend::S3(S3ObjectWriter::new(
            self.client.clone(),
            self.bucket.clone(),
            key.to_string(),
            self.timeout,
            retry.clone(),
        )))
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), AttemptError> {
        debug!(bucket = %self.bucket, key, len = bytes.len(), "📤 put_object");
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        bounded(self.timeout, "put_object", async move {
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("put_object", e))
        })
        .await
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), AttemptError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| classify_io_error(e, format!("💀 stat '{}'", path.display())))?
            .len();

        if size > self.multipart_threshold {
            // -- 🐘 the multipart writer retries each part with the run's policy; one more
            // -- layer on top would multiply the waits, so a failure here is final.
            return self
                .put_large_file(key, path)
                .await
                .map_err(AttemptError::Permanent);
        }

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| AttemptError::transient(anyhow::Error::new(e).context(format!(
                "💀 could not stream '{}' into a request body",
                path.display()
            ))))?;
        debug!(bucket = %self.bucket, key, size, "📤 put_object from file");
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size as i64)
            .body(body);
        bounded(self.timeout, "put_object", async move {
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("put_object", e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), AttemptError> {
        let request = self.client.delete_object().bucket(&self.bucket).key(key);
        bounded(self.timeout, "delete_object", async move {
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("delete_object", e))
        })
        .await
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
