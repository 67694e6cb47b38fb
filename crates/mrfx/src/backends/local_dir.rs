//! 📁 LocalDir store: a bucket with a `cd` command.
//!
//! Object keys map to relative paths under `path`. Parent directories are created on
//! demand. The streamed writer is a `BufWriter` over a tokio `File`, same as any honest
//! file sink: it writes in place and flushes on `finish`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::trace;

use crate::backends::{ObjectStore, ObjectWriter, ObjectWriterBackend, classify_io_error};
use crate::errors::AttemptError;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct LocalDirStoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(config: &LocalDirStoreConfig) -> Self {
        Self {
            root: config.path.clone(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    async fn ensure_parent(path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn open_writer(&self, key: &str, _retry: &RetryPolicy) -> Result<ObjectWriterBackend> {
        let path = self.path_for(key);
        Self::ensure_parent(&path).await.context(format!(
            "💀 Could not create the directory for '{}'. The folder tree said no.",
            path.display()
        ))?;
        let file = File::create(&path).await.context(format!(
            "💀 The output file '{}' could not be conjured into existence.",
            path.display()
        ))?;
        Ok(ObjectWriterBackend::LocalDir(LocalDirWriter {
            path,
            file: BufWriter::new(file),
            bytes_written: 0,
        }))
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), AttemptError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path)
            .await
            .map_err(|e| classify_io_error(e, format!("💀 creating parent of '{}'", path.display())))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| classify_io_error(e, format!("💀 writing '{}'", path.display())))
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<(), AttemptError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path)
            .await
            .map_err(|e| classify_io_error(e, format!("💀 creating parent of '{}'", path.display())))?;
        tokio::fs::copy(source, &path).await.map_err(|e| {
            classify_io_error(
                e,
                format!("💀 copying '{}' to '{}'", source.display(), path.display()),
            )
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AttemptError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // -- 🫥 already gone counts as deleted
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io_error(e, format!("💀 deleting '{}'", path.display()))),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[derive(Debug)]
pub struct LocalDirWriter {
    path: PathBuf,
    file: BufWriter<File>,
    bytes_written: u64,
}

#[async_trait]
impl ObjectWriter for LocalDirWriter {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()> {
        trace!(path = %self.path.display(), len = bytes.len(), "📬 local write");
        self.file.write_all(&bytes).await.context(format!(
            "💀 Writing to '{}' failed. The disk had other plans.",
            self.path.display()
        ))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        self.file.flush().await.context(format!(
            "💀 Flushing '{}' failed. The bytes were SO close to the disk.",
            self.path.display()
        ))?;
        Ok(self.bytes_written)
    }

    async fn abort(&mut self) -> Result<()> {
        let _ = self.file.flush().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("💀 removing aborted '{}'", self.path.display())),
        }
    }
}
