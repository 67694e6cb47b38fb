use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tracing::{debug, warn};

use super::{bounded, classify_sdk_error};
use crate::backends::ObjectWriter;
use crate::retry::RetryPolicy;

/// S3 minimum part size is 5 MiB (except the last). 8 MiB keeps us comfortably above it.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// ✍️ Streams an object into S3.
///
/// Small objects never see a multipart upload: everything stays in the buffer and
/// `finish` does a single PutObject. The multipart upload is created lazily when the
/// first full part is ready. Each part is retried on its own; the object only becomes
/// visible when `CompleteMultipartUpload` succeeds.
#[derive(Debug)]
pub struct S3ObjectWriter {
    client: Client,
    bucket: String,
    key: String,
    timeout: Duration,
    retry: RetryPolicy,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    bytes_written: u64,
}

impl S3ObjectWriter {
    pub(crate) fn new(
        client: Client,
        bucket: String,
        key: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            bucket,
            key,
            timeout,
            retry,
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
            bytes_written: 0,
        }
    }

    async fn ensure_upload(&mut self) -> Result<String> {
        if let Some(upload_id) = &self.upload_id {
            return Ok(upload_id.clone());
        }
        let (client, bucket, key, timeout) = (&self.client, &self.bucket, &self.key, self.timeout);
        let (output, _) = self
            .retry
            .run("s3 create_multipart_upload", |_| {
                let request = client.create_multipart_upload().bucket(bucket).key(key);
                bounded(timeout, "create_multipart_upload", async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("create_multipart_upload", e))
                })
            })
            .await
            .context(format!("💀 could not start a multipart upload for '{key}'"))?;
        let upload_id = output
            .upload_id()
            .map(str::to_string)
            .context("💀 S3 started a multipart upload and forgot to tell us its id")?;
        debug!(key = %self.key, upload_id = %upload_id, "🧩 multipart upload started");
        self.upload_id = Some(upload_id.clone());
        Ok(upload_id)
    }

    async fn upload_part(&mut self, chunk: Vec<u8>) -> Result<()> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;
        let (client, bucket, key, timeout) = (&self.client, &self.bucket, &self.key, self.timeout);
        let (output, _) = self
            .retry
            .run("s3 upload_part", |_| {
                let request = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk.clone()));
                bounded(timeout, "upload_part", async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("upload_part", e))
                })
            })
            .await
            .context(format!("💀 part {part_number} of '{key}' never made it"))?;
        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3ObjectWriter {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.bytes_written += bytes.len() as u64;
        self.buffer.extend(bytes);
        while self.buffer.len() >= PART_SIZE {
            let chunk: Vec<u8> = self.buffer.drain(..PART_SIZE).collect();
            self.upload_part(chunk).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        let remaining = std::mem::take(&mut self.buffer);
        let (client, bucket, key, timeout) = (&self.client, &self.bucket, &self.key, self.timeout);

        if self.upload_id.is_none() {
            self.retry
                .run("s3 put_object", |_| {
                    let request = client
                        .put_object()
                        .bucket(bucket)
                        .key(key)
                        .body(ByteStream::from(remaining.clone()));
                    bounded(timeout, "put_object", async move {
                        request
                            .send()
                            .await
                            .map_err(|e| classify_sdk_error("put_object", e))
                    })
                })
                .await
                .context(format!("💀 '{key}' could not be put"))?;
            return Ok(self.bytes_written);
        }

        if !remaining.is_empty() {
            self.upload_part(remaining).await?;
        }
        let upload_id = self.ensure_upload().await?;
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();
        let (client, bucket, key, timeout) = (&self.client, &self.bucket, &self.key, self.timeout);
        self.retry
            .run("s3 complete_multipart_upload", |_| {
                let request = client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed.clone());
                bounded(timeout, "complete_multipart_upload", async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("complete_multipart_upload", e))
                })
            })
            .await
            .context(format!("💀 the multipart upload of '{key}' would not complete"))?;
        self.upload_id = None;
        debug!(key = %self.key, parts = self.parts.len(), "✅ multipart upload completed");
        Ok(self.bytes_written)
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffer.clear();
        let Some(upload_id) = self.upload_id.take() else {
            return Ok(());
        };
        let result = bounded(self.timeout, "abort_multipart_upload", async {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| classify_sdk_error("abort_multipart_upload", e))
        })
        .await;
        if let Err(e) = &result {
            warn!(key = %self.key, error = %e, "⚠️ abandoned multipart upload could not be aborted");
        }
        result.map(|_| ()).map_err(anyhow::Error::new)
    }
}
