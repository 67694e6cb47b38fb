//! # Previously, on mrfx...
//!
//! 🎬 The artifacts were ready. The bucket was far away. The test suite had no
//! credentials and no patience. Someone had to be the bucket.
//!
//! That someone was this module.
//!
//! `InMemoryStore` keeps objects in a `BTreeMap` behind an `Arc<Mutex<...>>` so tests
//! can peek at what arrived. It also takes orders for misery: reject direct writers
//! (the probe fails, the run falls back), break writers for certain keys mid-stream,
//! or fail `put` calls a set number of times. Chaos engineering, but tiny. 🦆
//!
//! ⚠️ As a configured store (`store = "InMemory"`) it is a dry run: everything is
//! delivered, nothing survives the process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::{ObjectStore, ObjectWriter, ObjectWriterBackend, classify_io_error};
use crate::errors::AttemptError;
use crate::retry::RetryPolicy;

#[derive(Debug, Default)]
struct FaultPlan {
    reject_writers: bool,
    broken_writer_keys: Vec<String>,
    put_failures: Vec<(String, u32)>,
    put_attempts: u32,
}

/// 📦 A bucket that lives and dies with the process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🧪 Every `open_writer` fails, so the direct-write probe fails too.
    pub async fn reject_direct_writes(&self) {
        self.faults.lock().await.reject_writers = true;
    }

    /// 🧪 Writers for keys containing `needle` fail on their first `write`.
    pub async fn break_writers_for(&self, needle: &str) {
        self.faults
            .lock()
            .await
            .broken_writer_keys
            .push(needle.to_string());
    }

    /// 🧪 The next `times` puts for keys containing `needle` fail transiently.
    pub async fn fail_puts(&self, needle: &str, times: u32) {
        self.faults
            .lock()
            .await
            .put_failures
            .push((needle.to_string(), times));
    }

    /// Total put attempts seen, failed ones included.
    pub async fn put_attempts(&self) -> u32 {
        self.faults.lock().await.put_attempts
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    async fn check_put(&self, key: &str) -> Result<(), AttemptError> {
        let mut faults = self.faults.lock().await;
        faults.put_attempts += 1;
        if let Some((_, remaining)) = faults
            .put_failures
            .iter_mut()
            .find(|(needle, remaining)| *remaining > 0 && key.contains(needle.as_str()))
        {
            *remaining -= 1;
            return Err(AttemptError::transient(anyhow::anyhow!(
                "🧪 injected put failure for '{key}'"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn open_writer(&self, key: &str, _retry: &RetryPolicy) -> Result<ObjectWriterBackend> {
        let faults = self.faults.lock().await;
        if faults.reject_writers {
            bail!("🧪 direct writes are rejected by this in-memory store");
        }
        let broken = faults
            .broken_writer_keys
            .iter()
            .any(|needle| key.contains(needle.as_str()));
        Ok(ObjectWriterBackend::InMemory(InMemoryWriter {
            key: key.to_string(),
            buffer: Vec::new(),
            objects: self.objects.clone(),
            broken,
        }))
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), AttemptError> {
        self.check_put(key).await?;
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), AttemptError> {
        self.check_put(key).await?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| classify_io_error(e, format!("💀 reading '{}'", path.display())))?;
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AttemptError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// ✍️ Buffers everything, commits on `finish`. Atomic, like a good sandwich.
#[derive(Debug)]
pub struct InMemoryWriter {
    key: String,
    buffer: Vec<u8>,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    broken: bool,
}

#[async_trait]
impl ObjectWriter for InMemoryWriter {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()> {
        if self.broken {
            bail!("🧪 injected write failure for '{}'", self.key);
        }
        self.buffer.extend(bytes);
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        let bytes = std::mem::take(&mut self.buffer);
        let size = bytes.len() as u64;
        self.objects.lock().await.insert(self.key.clone(), bytes);
        Ok(size)
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }
}
