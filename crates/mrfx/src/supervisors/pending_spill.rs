//! 🅿️ The parking lot for reference rates.
//!
//! A rate whose provider groups live behind reference ids cannot be written until the
//! ids are resolved, and that only happens after the last record. Keeping them all in a
//! `Vec` makes memory grow with the file, so they go to an NDJSON file in the work dir
//! instead, one line per rate, and stream back in the same order during replay.
//!
//! The file is created on the first push and removed when the spill is dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tracing::{debug, warn};

use crate::transforms::{PreparedPrice, RecordContext};

// -- 🎟️ two runs in one process (batch mode, tests) must never share a parking lot
static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

/// A rate whose groups live behind reference ids, parked until Phase 2.
#[derive(Debug, Deserialize)]
pub(super) struct PendingRate {
    pub record_seq: u64,
    pub key: String,
    pub context: RecordContext,
    pub prices: Vec<PreparedPrice>,
    pub ids: Vec<String>,
}

/// The same line, borrowed, so parking a rate costs no clones.
#[derive(Debug, Serialize)]
pub(super) struct PendingRateRef<'a> {
    pub record_seq: u64,
    pub key: &'a str,
    pub context: &'a RecordContext,
    pub prices: &'a [PreparedPrice],
    pub ids: &'a [String],
}

/// ✍️ Append-only until `drain`, then read-only.
#[derive(Debug)]
pub(super) struct PendingSpill {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    created: bool,
    len: u64,
}

impl PendingSpill {
    pub(super) fn new(work_dir: &Path) -> Self {
        let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            path: work_dir.join(format!(".pending-rates-{}-{seq}.ndjson", std::process::id())),
            writer: None,
            created: false,
            len: 0,
        }
    }

    pub(super) fn len(&self) -> u64 {
        self.len
    }

    #[cfg(test)]
    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) async fn push(&mut self, rate: PendingRateRef<'_>) -> Result<()> {
        if self.created && self.writer.is_none() {
            anyhow::bail!("💀 pending rates were already drained, nothing more can be parked");
        }
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.context(format!(
                    "💀 could not create '{}' for pending rates",
                    parent.display()
                ))?;
            }
            let file = File::create(&self.path).await.context(format!(
                "💀 could not create the pending rate file '{}'",
                self.path.display()
            ))?;
            self.created = true;
            debug!(path = %self.path.display(), "🅿️ spilling reference rates to disk");
            self.writer = Some(BufWriter::new(file));
        }
        let Some(writer) = self.writer.as_mut() else {
            anyhow::bail!("💀 the pending rate file is not open");
        };
        let mut line = serde_json::to_vec(&rate).context("💀 a pending rate refused to serialize")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context(format!("💀 writing to '{}'", self.path.display()))?;
        self.len += 1;
        Ok(())
    }

    /// 🔁 Stop writing and hand back a reader over everything parked, in push order.
    pub(super) async fn drain(&mut self) -> Result<PendingReader> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(PendingReader { lines: None });
        };
        writer
            .flush()
            .await
            .context(format!("💀 flushing '{}'", self.path.display()))?;
        drop(writer);
        let file = File::open(&self.path).await.context(format!(
            "💀 reopening the pending rate file '{}'",
            self.path.display()
        ))?;
        Ok(PendingReader {
            lines: Some(BufReader::new(file).lines()),
        })
    }
}

impl Drop for PendingSpill {
    fn drop(&mut self) {
        if !self.created {
            return;
        }
        // -- 🧹 an open reader keeps its handle on unix; the name goes either way
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "⚠️ pending rate file could not be removed");
        }
    }
}

/// 📖 Streams parked rates back one line at a time.
#[derive(Debug)]
pub(super) struct PendingReader {
    lines: Option<Lines<BufReader<File>>>,
}

impl PendingReader {
    pub(super) async fn next(&mut self) -> Result<Option<PendingRate>> {
        let Some(lines) = &mut self.lines else {
            return Ok(None);
        };
        while let Some(line) = lines
            .next_line()
            .await
            .context("💀 reading the pending rate file back")?
        {
            if line.is_empty() {
                continue;
            }
            let rate = serde_json::from_str(&line)
                .context("💀 a pending rate line came back unreadable")?;
            return Ok(Some(rate));
        }
        Ok(None)
    }
}
