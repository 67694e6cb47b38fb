//! 🪣📡 S3 backend: AWS, Cloudflare R2, MinIO, anything that speaks the dialect.
//!
//! 🧠 Knowledge graph:
//! - `S3StoreConfig`: bucket, region (default `auto`), endpoint, optional static keys
//! - `R2StoreConfig`: account id + bucket + keys; becomes an `S3StoreConfig` pointed at
//!   `https://{account_id}.r2.cloudflarestorage.com`. Fields fall back to the classic
//!   `R2_ACCOUNT_ID`, `R2_BUCKET_NAME`, `R2_ACCESS_KEY_ID`, `R2_ACCESS_KEY_SECRET` env vars.
//! - `S3Store`: single-shot puts and deletes, one attempt each, classified for retry
//! - `S3ObjectWriter`: lazy multipart upload, 8 MiB parts, each part retried on its own
//!
//! Every SDK call is wrapped in `tokio::time::timeout`. Per operation, never per run.

mod s3_store;
mod s3_writer;

pub use s3_store::S3Store;
pub use s3_writer::S3ObjectWriter;

use std::future::Future;
use std::time::Duration;

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use serde::Deserialize;

use crate::errors::AttemptError;

/// 🔧 `[delivery.store.S3]`
#[derive(Deserialize, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_operation_timeout_secs() -> u64 {
    600
}

// -- 🎭 custom Debug so secrets never end up in a log line. the access key id is fine, the secret is not.
impl std::fmt::Debug for S3StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3StoreConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .finish()
    }
}

impl S3StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.trim().is_empty() {
            return Err("S3 store needs a non-empty 'bucket'".to_string());
        }
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), None) | (None, Some(_)) => Err(
                "S3 store has only half a credential pair: set both 'access_key_id' and 'secret_access_key', or neither"
                    .to_string(),
            ),
            _ => Ok(()),
        }
    }
}

/// 🔧 `[delivery.store.R2]`
#[derive(Deserialize, Clone)]
pub struct R2StoreConfig {
    #[serde(default = "r2_account_id_from_env")]
    pub account_id: Option<String>,
    #[serde(default = "r2_bucket_from_env")]
    pub bucket: Option<String>,
    #[serde(default = "r2_access_key_id_from_env")]
    pub access_key_id: Option<String>,
    #[serde(default = "r2_access_key_secret_from_env")]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn r2_account_id_from_env() -> Option<String> {
    non_empty_env("R2_ACCOUNT_ID")
}

fn r2_bucket_from_env() -> Option<String> {
    non_empty_env("R2_BUCKET_NAME")
}

fn r2_access_key_id_from_env() -> Option<String> {
    non_empty_env("R2_ACCESS_KEY_ID")
}

fn r2_access_key_secret_from_env() -> Option<String> {
    non_empty_env("R2_ACCESS_KEY_SECRET")
}

impl std::fmt::Debug for R2StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2StoreConfig")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl R2StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        let missing: Vec<&str> = [
            ("account_id / R2_ACCOUNT_ID", &self.account_id),
            ("bucket / R2_BUCKET_NAME", &self.bucket),
            ("access_key_id / R2_ACCESS_KEY_ID", &self.access_key_id),
            ("secret_access_key / R2_ACCESS_KEY_SECRET", &self.secret_access_key),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_none_or(|v| v.trim().is_empty()))
        .map(|(name, _)| name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("R2 store is missing: {}", missing.join(", ")))
        }
    }

    /// 🌩️ R2 is S3 with a Cloudflare accent.
    pub fn as_s3_config(&self) -> S3StoreConfig {
        let account_id = self.account_id.clone().unwrap_or_default();
        S3StoreConfig {
            bucket: self.bucket.clone().unwrap_or_default(),
            region: default_region(),
            endpoint_url: Some(format!("https://{account_id}.r2.cloudflarestorage.com")),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            force_path_style: false,
            operation_timeout_secs: self.operation_timeout_secs,
        }
    }
}

/// 🩺 SDK error triage: throttling, 5xx, timeouts and dispatch failures are worth another
/// try. A 403 is not going to change its mind.
pub(crate) fn classify_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> AttemptError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|response| response.status().as_u16());
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => {
            matches!(status, Some(code) if code >= 500 || code == 429 || code == 408)
        }
        _ => false,
    };
    let error = anyhow::anyhow!(
        "💀 s3 {operation} failed (status: {status:?}): {}",
        DisplayErrorContext(&err)
    );
    if transient {
        AttemptError::Transient(error)
    } else {
        AttemptError::Permanent(error)
    }
}

/// ⏱️ One SDK call, one deadline. Timeouts count as transient.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T, AttemptError>>,
) -> Result<T, AttemptError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AttemptError::transient(anyhow::anyhow!(
            "⏱️ s3 {operation} timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_r2_gets_its_endpoint_from_the_account_id() {
        let config = R2StoreConfig {
            account_id: Some("abc123".to_string()),
            bucket: Some("prices".to_string()),
            access_key_id: Some("id".to_string()),
            secret_access_key: Some("shh".to_string()),
            operation_timeout_secs: 60,
        };
        assert!(config.validate().is_ok());
        let s3 = config.as_s3_config();
        assert_eq!(
            s3.endpoint_url.as_deref(),
            Some("https://abc123.r2.cloudflarestorage.com")
        );
        assert_eq!(s3.region, "auto");
        assert_eq!(s3.bucket, "prices");
    }

    #[test]
    fn the_one_where_r2_lists_everything_it_is_missing() {
        let config = R2StoreConfig {
            account_id: None,
            bucket: Some("prices".to_string()),
            access_key_id: None,
            secret_access_key: Some("shh".to_string()),
            operation_timeout_secs: 60,
        };
        let err = config.validate().expect_err("💀 half a config is not a config");
        assert!(err.contains("account_id"));
        assert!(err.contains("access_key_id"));
        assert!(!err.contains("bucket"));
    }

    #[test]
    fn the_one_where_half_a_credential_pair_is_refused() {
        let config: S3StoreConfig = toml::from_str(
            r#"
            bucket = "prices"
            access_key_id = "id-only"
            "#,
        )
        .expect("💀 s3 config should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn the_one_where_the_secret_stays_out_of_debug_output() {
        let config: S3StoreConfig = toml::from_str(
            r#"
            bucket = "prices"
            access_key_id = "id"
            secret_access_key = "hunter2"
            "#,
        )
        .expect("💀 s3 config should parse");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    use crate::backends::{ObjectStore, ObjectWriter};
    use crate::retry::{RetryConfig, RetryPolicy};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn retry_with(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            base_delay_ms: 1,
            backoff: 1.0,
            max_delay_ms: 2,
        })
    }

    fn local_bucket(server: &MockServer) -> S3StoreConfig {
        S3StoreConfig {
            bucket: "prices".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some(server.uri()),
            access_key_id: Some("test".to_string()),
            secret_access_key: Some("test".to_string()),
            force_path_style: true,
            operation_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn the_one_where_the_big_file_path_retries_as_often_as_configured() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/prices/small.csv"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        // -- 🐘 threshold zero: even a tiny file takes the multipart writer's road
        let store = S3Store::new(&local_bucket(&server), retry_with(1))
            .await
            .expect("💀 store should build")
            .with_multipart_threshold(0);
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let file = dir.path().join("small.csv");
        std::fs::write(&file, b"a,b\n1,2\n").expect("💀 fixture write");

        let result = store.put_file("small.csv", &file).await;
        assert!(matches!(result, Err(AttemptError::Permanent(_))));
        server.verify().await;
    }

    #[tokio::test]
    async fn the_one_where_a_writer_goes_multipart_past_eight_mebibytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prices/big.csv"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><Bucket>prices</Bucket><Key>big.csv</Key>\
                 <UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/prices/big.csv"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part-etag\""))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prices/big.csv"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CompleteMultipartUploadResult><Bucket>prices</Bucket><Key>big.csv</Key>\
                 <ETag>\"whole-etag\"</ETag></CompleteMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let retry = retry_with(0);
        let store = S3Store::new(&local_bucket(&server), retry.clone())
            .await
            .expect("💀 store should build");
        let mut writer = store
            .open_writer("big.csv", &retry)
            .await
            .expect("💀 writer should open");
        let total = 8 * 1024 * 1024 + 1024;
        writer.write(vec![b'x'; total]).await.expect("💀 write");
        let stored = writer.finish().await.expect("💀 finish");
        assert_eq!(stored, total as u64);

        let requests = server.received_requests().await.expect("💀 recording is on");
        let part_puts = requests
            .iter()
            .filter(|r| r.method.as_str() == "PUT")
            .filter(|r| r.url.query_pairs().any(|(name, _)| name == "partNumber"))
            .count();
        let plain_puts = requests
            .iter()
            .filter(|r| r.method.as_str() == "PUT")
            .filter(|r| !r.url.query_pairs().any(|(name, _)| name == "uploadId"))
            .count();
        assert_eq!(part_puts, 2, "one full part, one remainder");
        assert_eq!(plain_puts, 0, "no single PutObject once multipart started");
        server.verify().await;
    }
}
