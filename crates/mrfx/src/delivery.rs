//! 🚚 Delivery: getting finished artifacts from "written" to "durably somewhere else".
//!
//! Two strategies, chosen ONCE per run:
//!
//! ```text
//!   Direct:    rows ──▶ composer ──▶ ObjectWriter (multipart / file / memory) ──▶ finish ✅
//!   Fallback:  rows ──▶ composer ──▶ local temp file ──close──▶ upload pool ──▶ put_file ✅ ──▶ rm temp
//!                                                                           └──▶ ❌ keep temp, report it
//! ```
//!
//! 🔒 The one rule that matters: the local copy is deleted only AFTER the upload call
//! returned success. Not before. Not "at about the same time". After.
//!
//! The probe writes and deletes `{prefix}/_mrfx_probe` through a streamed writer. If that
//! works, the run goes Direct. If it throws, the run goes Fallback and stays there, so
//! every artifact of the run shares the same delivery semantics.
//!
//! Failures are bookkept, not thrown: an artifact that exhausted its retries lands in
//! `DeliveryReport::undelivered` and the run keeps going. The manifest tells the story,
//! the missing `_SUCCESS` marker tells the robots. 🦆

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backends::{
    ObjectStore, ObjectStoreBackend, ObjectStoreConfig, ObjectWriter, ObjectWriterBackend,
};
use crate::composers::{Composer, ComposerBackend, OutputCompression};
use crate::retry::{RetryConfig, RetryPolicy};

const PROBE_NAME: &str = "_mrfx_probe";

/// 🔧 `[delivery]`
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Skip the probe and buffer-then-upload everything.
    #[serde(default)]
    pub force_fallback: bool,
    pub store: ObjectStoreConfig,
}

/// 🔧 `[output]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// Key prefix inside the store. Empty means the root.
    #[serde(default)]
    pub prefix: String,
    /// Where fallback temp files live until their upload succeeds.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub compression: OutputCompression,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("mrfx-work")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            work_dir: default_work_dir(),
            compression: OutputCompression::default(),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    Direct,
    Fallback,
}

impl std::fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStrategy::Direct => f.write_str("direct"),
            DeliveryStrategy::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DeliveredArtifact {
    pub key: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct UndeliveredArtifact {
    pub key: String,
    pub reason: String,
    /// The surviving local copy, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// 📬 Everything delivery knows at the end of the run.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DeliveryReport {
    pub strategy: DeliveryStrategy,
    pub destination: String,
    pub delivered: Vec<DeliveredArtifact>,
    pub undelivered: Vec<UndeliveredArtifact>,
    pub rows_discarded: u64,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.undelivered.is_empty()
    }

    /// Rows inside delivered parts. Small artifacts carry no row count and add nothing.
    pub fn rows_delivered(&self) -> u64 {
        self.delivered.iter().filter_map(|artifact| artifact.rows).sum()
    }
}

#[derive(Debug)]
struct DeliveryInner {
    store: ObjectStoreBackend,
    strategy: DeliveryStrategy,
    retry: RetryPolicy,
    work_dir: PathBuf,
    prefix: String,
    compression: OutputCompression,
    uploads: Mutex<JoinSet<()>>,
    permits: Arc<Semaphore>,
    report: Mutex<DeliveryReport>,
}

/// 🚚 The delivery desk. Clone it freely; every clone shares one report and one upload pool.
#[derive(Debug, Clone)]
pub struct ArtifactDelivery {
    inner: Arc<DeliveryInner>,
}

impl ArtifactDelivery {
    /// 🩺 Probe the store, pick a strategy, and open for business.
    pub async fn new(
        store: ObjectStoreBackend,
        config: &DeliveryConfig,
        output: &OutputConfig,
        retry: RetryPolicy,
        upload_concurrency: usize,
    ) -> Result<Self> {
        let prefix = output.prefix.trim_matches('/').to_string();
        let strategy = if config.force_fallback {
            info!("🧳 fallback delivery forced by config, skipping the probe");
            DeliveryStrategy::Fallback
        } else {
            let probe_key = join_key(&prefix, PROBE_NAME);
            match probe(&store, &probe_key).await {
                Ok(()) => {
                    info!(destination = %store.describe(), "🚀 direct writes work, streaming straight to the store");
                    DeliveryStrategy::Direct
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "🧳 direct-write probe failed, buffering locally and uploading instead");
                    DeliveryStrategy::Fallback
                }
            }
        };

        if strategy == DeliveryStrategy::Fallback {
            tokio::fs::create_dir_all(&output.work_dir)
                .await
                .context(format!(
                    "💀 The work directory '{}' could not be created. Fallback delivery needs somewhere to put things down.",
                    output.work_dir.display()
                ))?;
        }

        let destination = store.describe();
        Ok(Self {
            inner: Arc::new(DeliveryInner {
                store,
                strategy,
                retry,
                work_dir: output.work_dir.clone(),
                prefix,
                compression: output.compression,
                uploads: Mutex::new(JoinSet::new()),
                permits: Arc::new(Semaphore::new(upload_concurrency.max(1))),
                report: Mutex::new(DeliveryReport {
                    strategy,
                    destination,
                    delivered: Vec::new(),
                    undelivered: Vec::new(),
                    rows_discarded: 0,
                }),
            }),
        })
    }

    pub fn strategy(&self) -> DeliveryStrategy {
        self.inner.strategy
    }

    pub fn compression(&self) -> OutputCompression {
        self.inner.compression
    }

    /// `{prefix}/{name}`, or just `name` without a prefix.
    pub fn object_key(&self, name: &str) -> String {
        join_key(&self.inner.prefix, name)
    }

    /// 📂 Open a streamed artifact called `name` (prefix is added here).
    pub async fn open_sink(&self, name: &str, header: &[&str]) -> Result<ArtifactSink> {
        let key = self.object_key(name);
        let composer = ComposerBackend::new(self.inner.compression, header)?;
        let (target, failure) = match self.inner.strategy {
            DeliveryStrategy::Direct => {
                match self.inner.store.open_writer(&key, &self.inner.retry).await {
                    Ok(writer) => (SinkTarget::Direct(writer), None),
                    Err(e) => {
                        let reason = format!("{e:#}");
                        error!(key = %key, error = %reason, "💀 could not open a direct writer, rows for this artifact are lost");
                        (SinkTarget::Broken, Some(reason))
                    }
                }
            }
            DeliveryStrategy::Fallback => {
                // -- 🧳 flattened key, so every staged file sits directly in work_dir
                let path = self.inner.work_dir.join(key.replace('/', "__"));
                let file = File::create(&path).await.context(format!(
                    "💀 The staging file '{}' could not be created. The local disk is the last line of defense and it just fell.",
                    path.display()
                ))?;
                (
                    SinkTarget::Staged {
                        path,
                        file: BufWriter::new(file),
                    },
                    None,
                )
            }
        };
        debug!(key = %key, strategy = %self.inner.strategy, "📂 artifact opened");
        Ok(ArtifactSink {
            key,
            composer,
            target,
            rows: 0,
            rows_discarded: 0,
            failure,
        })
    }

    /// 📦 Close `sink` and hand it off. Direct sinks are finalized here; staged sinks are
    /// queued on the upload pool. Delivery failures are recorded, local disk failures are
    /// returned.
    pub async fn close_sink(&self, sink: ArtifactSink) -> Result<()> {
        let ArtifactSink {
            key,
            composer,
            target,
            rows,
            rows_discarded,
            failure,
        } = sink;
        let tail = composer.finish()?;

        if rows_discarded > 0 {
            self.inner.report.lock().await.rows_discarded += rows_discarded;
        }

        match target {
            SinkTarget::Broken => {
                self.record_undelivered(key, failure.unwrap_or_default(), None)
                    .await;
            }
            SinkTarget::Direct(mut writer) => {
                // -- ☠️ poisoned mid-run: the writer was aborted back when it broke
                if let Some(reason) = failure {
                    self.record_undelivered(key, reason, None).await;
                    return Ok(());
                }
                let finished = match writer.write(tail).await {
                    Ok(()) => writer.finish().await,
                    Err(e) => Err(e),
                };
                match finished {
                    Ok(bytes) => self.record_delivered(key, bytes, Some(rows)).await,
                    Err(e) => {
                        let reason = format!("{e:#}");
                        error!(key = %key, error = %reason, "💀 direct artifact could not be finalized");
                        let _ = writer.abort().await;
                        self.record_undelivered(key, reason, None).await;
                    }
                }
            }
            SinkTarget::Staged { path, mut file } => {
                // -- 💾 a disk error here ends the run; it is not an undelivered artifact
                file.write_all(&tail).await.context(format!(
                    "💀 The last bytes of '{}' would not go to disk.",
                    path.display()
                ))?;
                file.flush().await.context(format!(
                    "💀 Flushing '{}' failed. The bytes were SO close.",
                    path.display()
                ))?;
                drop(file);
                self.queue_upload(key, path, rows).await;
            }
        }
        Ok(())
    }

    /// 📨 Deliver a small in-memory artifact (manifest, marker). Returns whether it landed.
    pub async fn put_small(&self, name: &str, bytes: Vec<u8>) -> bool {
        let key = self.object_key(name);
        let size = bytes.len() as u64;
        let store = &self.inner.store;
        let outcome = self
            .inner
            .retry
            .run(&format!("put {key}"), |_| store.put_bytes(&key, bytes.clone()))
            .await;
        match outcome {
            Ok(_) => {
                self.record_delivered(key, size, None).await;
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "💀 small artifact could not be delivered");
                self.record_undelivered(key, e.to_string(), None).await;
                false
            }
        }
    }

    /// 🧽 Best-effort delete of a leftover artifact, such as a previous run's marker.
    pub async fn remove(&self, name: &str) {
        let key = self.object_key(name);
        let store = &self.inner.store;
        let outcome = self
            .inner
            .retry
            .run(&format!("delete {key}"), |_| store.delete(&key))
            .await;
        if let Err(e) = outcome {
            warn!(key = %key, error = %e, "⚠️ could not remove a stale artifact");
        }
    }

    /// ⏳ Wait for every queued upload and return the final report.
    pub async fn finish(&self) -> DeliveryReport {
        let mut uploads = self.inner.uploads.lock().await;
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "💀 an upload task panicked; its artifact is unaccounted for");
                self.record_undelivered("<unknown>".to_string(), e.to_string(), None)
                    .await;
            }
        }
        self.inner.report.lock().await.clone()
    }

    async fn queue_upload(&self, key: String, path: PathBuf, rows: u64) {
        let delivery = self.clone();
        let mut uploads = self.inner.uploads.lock().await;
        uploads.spawn(async move {
            // -- 🎟️ the semaphore is never closed, so this only ever waits
            let _permit = delivery.inner.permits.clone().acquire_owned().await;
            delivery.upload_then_delete(key, path, rows).await;
        });
    }

    /// 📤 Upload with retry; delete the local file only after success.
    async fn upload_then_delete(&self, key: String, path: PathBuf, rows: u64) {
        let store = &self.inner.store;
        let outcome = self
            .inner
            .retry
            .run(&format!("upload {key}"), |_| store.put_file(&key, &path))
            .await;
        match outcome {
            Ok((_, attempts)) => {
                let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "⚠️ uploaded, but the temp file refused to leave");
                }
                debug!(key = %key, attempts, "✅ staged artifact uploaded and cleaned up");
                self.record_delivered(key, bytes, Some(rows)).await;
            }
            Err(e) => {
                error!(key = %key, path = %path.display(), error = %e, "💀 upload gave up, keeping the local copy");
                self.record_undelivered(key, e.to_string(), Some(path)).await;
            }
        }
    }

    async fn record_delivered(&self, key: String, bytes: u64, rows: Option<u64>) {
        self.inner
            .report
            .lock()
            .await
            .delivered
            .push(DeliveredArtifact { key, bytes, rows });
    }

    async fn record_undelivered(&self, key: String, reason: String, local_path: Option<PathBuf>) {
        self.inner
            .report
            .lock()
            .await
            .undelivered
            .push(UndeliveredArtifact {
                key,
                reason,
                local_path,
            });
    }
}

/// 🩺 Write-and-delete through a real streamed writer, one attempt, no mercy.
async fn probe(store: &ObjectStoreBackend, key: &str) -> Result<()> {
    let once = RetryPolicy::new(&RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    });
    let mut writer = store.open_writer(key, &once).await?;
    writer.write(b"probe".to_vec()).await?;
    writer.finish().await?;
    store
        .delete(key)
        .await
        .map_err(anyhow::Error::new)
        .context("💀 the probe object was written but could not be deleted")?;
    Ok(())
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

enum SinkTarget {
    Direct(ObjectWriterBackend),
    Staged { path: PathBuf, file: BufWriter<File> },
    Broken,
}

impl std::fmt::Debug for SinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkTarget::Direct(writer) => f.debug_tuple("Direct").field(writer).finish(),
            SinkTarget::Staged { path, .. } => f.debug_struct("Staged").field("path", path).finish(),
            SinkTarget::Broken => f.write_str("Broken"),
        }
    }
}

/// ✍️ One open artifact. Owned by whoever writes it, handed back to delivery at close.
#[derive(Debug)]
pub struct ArtifactSink {
    key: String,
    composer: ComposerBackend,
    target: SinkTarget,
    rows: u64,
    rows_discarded: u64,
    failure: Option<String>,
}

impl ArtifactSink {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_poisoned(&self) -> bool {
        self.failure.is_some()
    }

    /// Staged file path, for fallback sinks.
    #[cfg(test)]
    pub(crate) fn local_path(&self) -> Option<&Path> {
        match &self.target {
            SinkTarget::Staged { path, .. } => Some(path),
            _ => None,
        }
    }

    /// 🧾 Encode one row; flush to the target once `flush_rows` rows are buffered.
    ///
    /// A poisoned sink swallows rows and counts them as discarded.
    pub async fn write_row<S: Serialize + Sync>(&mut self, row: &S, flush_rows: usize) -> Result<()> {
        if self.failure.is_some() {
            self.rows_discarded += 1;
            return Ok(());
        }
        self.composer.compose_row(row)?;
        self.rows += 1;
        if self.composer.buffered_rows() >= flush_rows.max(1) {
            self.flush().await?;
        }
        Ok(())
    }

    /// 🚿 Push buffered bytes to the target. Remote failures poison the sink; local ones bubble up.
    pub async fn flush(&mut self) -> Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        let bytes = self.composer.drain()?;
        if bytes.is_empty() {
            return Ok(());
        }
        match &mut self.target {
            SinkTarget::Direct(writer) => {
                if let Err(e) = writer.write(bytes).await {
                    let reason = format!("{e:#}");
                    error!(key = %self.key, error = %reason, "💀 direct write gave up, poisoning this artifact");
                    let _ = writer.abort().await;
                    // -- 🧮 rows already composed into this artifact will never arrive either
                    self.rows_discarded += self.rows;
                    self.rows = 0;
                    self.failure = Some(reason);
                }
            }
            SinkTarget::Staged { path, file } => {
                file.write_all(&bytes).await.context(format!(
                    "💀 Writing to staging file '{}' failed. The disk had other plans.",
                    path.display()
                ))?;
            }
            SinkTarget::Broken => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            backoff: 1.5,
            max_delay_ms: 2,
        })
    }

    fn output(work_dir: &Path) -> OutputConfig {
        OutputConfig {
            prefix: "run-1".to_string(),
            work_dir: work_dir.to_path_buf(),
            compression: OutputCompression::None,
        }
    }

    async fn delivery_for(
        store: &InMemoryStore,
        work_dir: &Path,
        force_fallback: bool,
    ) -> ArtifactDelivery {
        ArtifactDelivery::new(
            ObjectStoreBackend::InMemory(store.clone()),
            &DeliveryConfig {
                force_fallback,
                store: ObjectStoreConfig::InMemory,
            },
            &output(work_dir),
            quick_retry(),
            2,
        )
        .await
        .expect("💀 delivery should start")
    }

    #[derive(Serialize)]
    struct Row<'a> {
        a: &'a str,
    }

    #[tokio::test]
    async fn the_one_where_the_probe_passes_and_leaves_no_trace() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        let delivery = delivery_for(&store, dir.path(), false).await;
        assert_eq!(delivery.strategy(), DeliveryStrategy::Direct);
        assert!(store.keys().await.is_empty(), "probe object must be deleted");
    }

    #[tokio::test]
    async fn the_one_where_a_failed_probe_sends_everyone_to_fallback() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        store.reject_direct_writes().await;
        let delivery = delivery_for(&store, dir.path(), false).await;
        assert_eq!(delivery.strategy(), DeliveryStrategy::Fallback);
    }

    #[tokio::test]
    async fn the_one_where_direct_rows_land_after_close() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        let delivery = delivery_for(&store, dir.path(), false).await;

        let mut sink = delivery.open_sink("x.csv", &["a"]).await.expect("💀 open");
        for value in ["1", "2", "3"] {
            sink.write_row(&Row { a: value }, 2).await.expect("💀 write");
        }
        delivery.close_sink(sink).await.expect("💀 close");
        let report = delivery.finish().await;

        assert_eq!(
            store.object("run-1/x.csv").await.as_deref(),
            Some(&b"a\n1\n2\n3\n"[..])
        );
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].rows, Some(3));
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn the_one_where_the_upload_succeeds_and_only_then_the_temp_file_goes() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        store.fail_puts("x.csv", 2).await;
        let delivery = delivery_for(&store, dir.path(), true).await;

        let mut sink = delivery.open_sink("x.csv", &["a"]).await.expect("💀 open");
        sink.write_row(&Row { a: "1" }, 10).await.expect("💀 write");
        let staged = sink.local_path().expect("💀 fallback sinks are staged").to_path_buf();
        delivery.close_sink(sink).await.expect("💀 close");
        let report = delivery.finish().await;

        assert!(report.is_complete());
        assert_eq!(store.put_attempts().await, 3);
        assert_eq!(store.object("run-1/x.csv").await.as_deref(), Some(&b"a\n1\n"[..]));
        assert!(!staged.exists(), "temp file goes away after a confirmed upload");
    }

    #[tokio::test]
    async fn the_one_where_the_upload_never_succeeds_and_the_temp_file_survives() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        store.fail_puts("x.csv", u32::MAX).await;
        let delivery = delivery_for(&store, dir.path(), true).await;

        let mut sink = delivery.open_sink("x.csv", &["a"]).await.expect("💀 open");
        sink.write_row(&Row { a: "1" }, 10).await.expect("💀 write");
        let staged = sink.local_path().expect("💀 staged").to_path_buf();
        delivery.close_sink(sink).await.expect("💀 close");
        let report = delivery.finish().await;

        assert!(!report.is_complete());
        assert_eq!(report.undelivered.len(), 1);
        assert_eq!(report.undelivered[0].local_path.as_deref(), Some(staged.as_path()));
        assert!(staged.exists(), "no confirmed upload, no deletion");
        assert_eq!(
            std::fs::read_to_string(&staged).expect("💀 staged file readable"),
            "a\n1\n"
        );
    }

    #[tokio::test]
    async fn the_one_where_a_broken_direct_writer_poisons_only_its_own_artifact() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        store.break_writers_for("bad").await;
        let delivery = delivery_for(&store, dir.path(), false).await;

        let mut bad = delivery.open_sink("bad.csv", &["a"]).await.expect("💀 open bad");
        let mut good = delivery.open_sink("good.csv", &["a"]).await.expect("💀 open good");
        for value in ["1", "2", "3"] {
            bad.write_row(&Row { a: value }, 1).await.expect("💀 poisoned writes are swallowed");
            good.write_row(&Row { a: value }, 1).await.expect("💀 good write");
        }
        assert!(bad.is_poisoned());
        delivery.close_sink(bad).await.expect("💀 close bad");
        delivery.close_sink(good).await.expect("💀 close good");
        let report = delivery.finish().await;

        assert_eq!(report.undelivered.len(), 1);
        assert_eq!(report.undelivered[0].key, "run-1/bad.csv");
        assert_eq!(report.rows_discarded, 3);
        assert!(store.object("run-1/good.csv").await.is_some());
        assert!(store.object("run-1/bad.csv").await.is_none());
    }

    #[tokio::test]
    async fn the_one_where_small_artifacts_retry_their_way_in() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let store = InMemoryStore::new();
        store.fail_puts("manifest", 1).await;
        let delivery = delivery_for(&store, dir.path(), false).await;
        assert!(delivery.put_small("manifest.json", b"{}".to_vec()).await);
        assert_eq!(store.object("run-1/manifest.json").await.as_deref(), Some(&b"{}"[..]));
    }
}
