//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 On the way in: `document_stream` turns a squished 40 GB file into a polite queue
//! of records. On the way out: an `ObjectStore` swallows finished artifacts.
//!
//! 🎭 Store casting call:
//! - `S3`       → any S3-compatible bucket (AWS, R2, MinIO). Multipart for big objects.
//! - `LocalDir` → a directory on disk. For dev boxes and "just let me look at the CSV".
//! - `InMemory` → RAM. For tests, dry runs, and failure injection with a straight face.
//!
//! Same pattern as always: trait → concrete impls → enum dispatch. The delivery layer
//! never learns which one it's talking to. Ignorance is a feature. It's called
//! "abstraction." 🦆

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::AttemptError;
use crate::retry::RetryPolicy;

pub(crate) mod document_stream;
pub(crate) mod in_mem;
pub(crate) mod local_dir;
pub(crate) mod s3;

pub use document_stream::{Decompression, DocumentEvent, DocumentStream, InputConfig};
pub use in_mem::InMemoryStore;
pub use local_dir::LocalDirStoreConfig;
pub use s3::{R2StoreConfig, S3StoreConfig};

// ===== Store Trait and Backend Enum =====

/// 🪣 Where finished artifacts live.
///
/// # Contract
/// - `open_writer` starts a streamed object. Nothing is visible to readers until the
///   writer's `finish` succeeds (S3 and in-memory; the local dir writes in place).
/// - `put_bytes`, `put_file`, `delete` perform ONE attempt and classify the failure.
///   Retrying is the caller's business, via `RetryPolicy::run`.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync {
    async fn open_writer(&self, key: &str, retry: &RetryPolicy) -> Result<ObjectWriterBackend>;
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), AttemptError>;
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), AttemptError>;
    async fn delete(&self, key: &str) -> Result<(), AttemptError>;
    /// Human-readable location, for logs and the manifest.
    fn describe(&self) -> String;
}

/// ✍️ A streamed object in progress.
///
/// # Contract
/// - `write` may buffer; remote calls inside it are retried by the writer itself.
/// - `finish` must be called exactly once on success. It returns total bytes stored.
/// - `abort` throws away whatever was started. Safe to call after a failed write.
#[async_trait]
pub trait ObjectWriter: std::fmt::Debug + Send {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()>;
    async fn finish(&mut self) -> Result<u64>;
    async fn abort(&mut self) -> Result<()>;
}

/// 🔧 `[delivery.store]`: pick exactly one.
#[derive(Debug, Deserialize, Clone)]
pub enum ObjectStoreConfig {
    S3(S3StoreConfig),
    R2(R2StoreConfig),
    LocalDir(LocalDirStoreConfig),
    InMemory,
}

impl ObjectStoreConfig {
    /// 🔒 Fail fast on configs that can only end in tears.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ObjectStoreConfig::S3(config) => config.validate(),
            ObjectStoreConfig::R2(config) => config.validate(),
            ObjectStoreConfig::LocalDir(config) => {
                if config.path.as_os_str().is_empty() {
                    Err("LocalDir store needs a non-empty 'path'".to_string())
                } else {
                    Ok(())
                }
            }
            ObjectStoreConfig::InMemory => Ok(()),
        }
    }
}

/// 🎭 The many faces of an object store.
#[derive(Debug, Clone)]
pub enum ObjectStoreBackend {
    S3(s3::S3Store),
    LocalDir(local_dir::LocalDirStore),
    InMemory(in_mem::InMemoryStore),
}

impl ObjectStoreBackend {
    /// 🏗️ Build the store named by the config. R2 is S3 with a different accent.
    ///
    /// `retry` is the run's policy. Stores that retry internally (the S3 multipart path)
    /// use it instead of inventing their own.
    pub async fn from_config(config: &ObjectStoreConfig, retry: &RetryPolicy) -> Result<Self> {
        Ok(match config {
            ObjectStoreConfig::S3(s3_config) => {
                ObjectStoreBackend::S3(s3::S3Store::new(s3_config, retry.clone()).await?)
            }
            ObjectStoreConfig::R2(r2_config) => ObjectStoreBackend::S3(
                s3::S3Store::new(&r2_config.as_s3_config(), retry.clone()).await?,
            ),
            ObjectStoreConfig::LocalDir(dir_config) => {
                ObjectStoreBackend::LocalDir(local_dir::LocalDirStore::new(dir_config))
            }
            ObjectStoreConfig::InMemory => ObjectStoreBackend::InMemory(InMemoryStore::new()),
        })
    }
}

#[async_trait]
impl ObjectStore for ObjectStoreBackend {
    async fn open_writer(&self, key: &str, retry: &RetryPolicy) -> Result<ObjectWriterBackend> {
        match self {
            ObjectStoreBackend::S3(store) => store.open_writer(key, retry).await,
            ObjectStoreBackend::LocalDir(store) => store.open_writer(key, retry).await,
            ObjectStoreBackend::InMemory(store) => store.open_writer(key, retry).await,
        }
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), AttemptError> {
        match self {
            ObjectStoreBackend::S3(store) => store.put_bytes(key, bytes).await,
            ObjectStoreBackend::LocalDir(store) => store.put_bytes(key, bytes).await,
            ObjectStoreBackend::InMemory(store) => store.put_bytes(key, bytes).await,
        }
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), AttemptError> {
        match self {
            ObjectStoreBackend::S3(store) => store.put_file(key, path).await,
            ObjectStoreBackend::LocalDir(store) => store.put_file(key, path).await,
            ObjectStoreBackend::InMemory(store) => store.put_file(key, path).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), AttemptError> {
        match self {
            ObjectStoreBackend::S3(store) => store.delete(key).await,
            ObjectStoreBackend::LocalDir(store) => store.delete(key).await,
            ObjectStoreBackend::InMemory(store) => store.delete(key).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            ObjectStoreBackend::S3(store) => store.describe(),
            ObjectStoreBackend::LocalDir(store) => store.describe(),
            ObjectStoreBackend::InMemory(store) => store.describe(),
        }
    }
}

/// 🎭 The many faces of an in-progress object.
#[derive(Debug)]
pub enum ObjectWriterBackend {
    S3(s3::S3ObjectWriter),
    LocalDir(local_dir::LocalDirWriter),
    InMemory(in_mem::InMemoryWriter),
}

#[async_trait]
impl ObjectWriter for ObjectWriterBackend {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()> {
        match self {
            ObjectWriterBackend::S3(writer) => writer.write(bytes).await,
            ObjectWriterBackend::LocalDir(writer) => writer.write(bytes).await,
            ObjectWriterBackend::InMemory(writer) => writer.write(bytes).await,
        }
    }

    async fn finish(&mut self) -> Result<u64> {
        match self {
            ObjectWriterBackend::S3(writer) => writer.finish().await,
            ObjectWriterBackend::LocalDir(writer) => writer.finish().await,
            ObjectWriterBackend::InMemory(writer) => writer.finish().await,
        }
    }

    async fn abort(&mut self) -> Result<()> {
        match self {
            ObjectWriterBackend::S3(writer) => writer.abort().await,
            ObjectWriterBackend::LocalDir(writer) => writer.abort().await,
            ObjectWriterBackend::InMemory(writer) => writer.abort().await,
        }
    }
}

/// 🩺 Local I/O triage: missing files and permission walls don't heal with time.
pub(crate) fn classify_io_error(error: std::io::Error, what: String) -> AttemptError {
    use std::io::ErrorKind;
    let permanent = matches!(
        error.kind(),
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput
    );
    let error = anyhow::Error::new(error).context(what);
    if permanent {
        AttemptError::Permanent(error)
    } else {
        AttemptError::Transient(error)
    }
}
