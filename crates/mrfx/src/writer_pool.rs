//! 🏊 Writer pool: a bounded set of open artifacts, one per partition key.
//!
//! 🧠 Knowledge graph:
//! - `open`: key → (part index, last-used tick, sink). Never larger than `capacity`.
//! - `recency`: tick → key. The smallest tick is the least recently used key.
//! - `part_counts`: key → parts closed so far. The next open for a key uses this
//!   number, so reopening always lands on a fresh part.
//!
//! ```text
//!   write_rows(key) ──▶ acquire(key) ──▶ open? ──yes──▶ touch, write
//!                         └──no──▶ full? ──yes──▶ evict LRU (close + hand off)
//!                                   └──────────▶ open part_counts[key], write
//! ```
//!
//! Closing hands the sink to delivery and forgets about it. Delivery decides what
//! "closed" means for the bytes (finished upload, or queued one).

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::composers::OutputCompression;
use crate::delivery::{ArtifactDelivery, ArtifactSink};
use crate::transforms::{FlatRow, OUTPUT_COLUMNS};

/// 🔄 When a partition key gets a new part.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// Close the key when the record that wrote to it ends.
    #[default]
    RecordBoundary,
    /// Keep keys open until they are evicted or the run ends.
    EvictionOnly,
    /// Close a part once it holds `max_rows` rows.
    RowThreshold { max_rows: u64 },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub parts_opened: u64,
    pub parts_closed: u64,
    pub evictions: u64,
    pub peak_open: usize,
    pub rows_emitted: u64,
}

#[derive(Debug)]
struct OpenSink {
    part: u32,
    last_used: u64,
    sink: ArtifactSink,
}

#[derive(Debug)]
pub struct WriterPool {
    delivery: ArtifactDelivery,
    capacity: usize,
    flush_rows: usize,
    rotation: RotationPolicy,
    tick: u64,
    open: HashMap<String, OpenSink>,
    recency: BTreeMap<u64, String>,
    part_counts: BTreeMap<String, u32>,
    stats: PoolStats,
}

impl WriterPool {
    pub fn new(
        delivery: ArtifactDelivery,
        capacity: usize,
        flush_rows: usize,
        rotation: RotationPolicy,
    ) -> Self {
        Self {
            delivery,
            capacity: capacity.max(1),
            flush_rows: flush_rows.max(1),
            rotation,
            tick: 0,
            open: HashMap::new(),
            recency: BTreeMap::new(),
            part_counts: BTreeMap::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Parts produced per key (sanitized), for the manifest.
    pub fn part_counts(&self) -> &BTreeMap<String, u32> {
        &self.part_counts
    }

    /// 🎣 The open sink for `key`, marked most recently used. Not open? Evict the LRU key
    /// if the pool is full, then open `key` at its next part number.
    pub async fn acquire(&mut self, key: &str) -> Result<&mut ArtifactSink> {
        let key = sanitize_key(key);
        self.ensure_open(&key).await?;
        self.sink_mut(&key)
    }

    /// ✍️ Write `rows` to `key`'s current part. Returns the number of rows handed over.
    ///
    /// An empty iterator opens nothing.
    pub async fn write_rows<'a, I>(&mut self, key: &str, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = FlatRow<'a>>,
    {
        let key = sanitize_key(key);
        let threshold = match self.rotation {
            RotationPolicy::RowThreshold { max_rows } => Some(max_rows.max(1)),
            _ => None,
        };
        let flush_rows = self.flush_rows;
        let mut written = 0u64;

        for row in rows {
            // -- 🎣 per row, not per call: a threshold close mid-batch means the next row reopens
            let sink = self.acquire(&key).await?;
            sink.write_row(&row, flush_rows).await?;
            written += 1;
            let full = threshold.is_some_and(|max_rows| sink.rows() >= max_rows);
            if full {
                trace!(key = %key, "🔄 part reached its row threshold");
                self.close(&key).await?;
            }
        }

        self.stats.rows_emitted += written;
        Ok(written)
    }

    /// 🏁 The record that wrote to `key` is done. Only `RecordBoundary` cares.
    pub async fn end_of_record(&mut self, key: &str) -> Result<()> {
        if self.rotation == RotationPolicy::RecordBoundary {
            self.close(key).await?;
        }
        Ok(())
    }

    /// 📦 Close `key`'s open part and hand it to delivery. Not open? Nothing happens.
    pub async fn close(&mut self, key: &str) -> Result<()> {
        let key = sanitize_key(key);
        let Some(open) = self.open.remove(&*key) else {
            return Ok(());
        };
        self.recency.remove(&open.last_used);
        *self.part_counts.entry(key.to_string()).or_insert(0) += 1;
        self.stats.parts_closed += 1;
        debug!(
            key = %key,
            part = open.part,
            artifact = open.sink.key(),
            rows = open.sink.rows(),
            poisoned = open.sink.is_poisoned(),
            "📦 part closed"
        );
        self.delivery.close_sink(open.sink).await
    }

    /// 🧹 Close everything, oldest first. Safe to call twice.
    pub async fn close_all(&mut self) -> Result<()> {
        let keys: Vec<String> = self.recency.values().cloned().collect();
        for key in keys {
            self.close(&key).await?;
        }
        Ok(())
    }

    async fn ensure_open(&mut self, key: &str) -> Result<()> {
        // -- ⏰ a monotonic tick, not a clock. clocks go backwards, ticks only go up
        self.tick += 1;
        let tick = self.tick;

        if let Some(open) = self.open.get_mut(key) {
            self.recency.remove(&open.last_used);
            open.last_used = tick;
            self.recency.insert(tick, key.to_string());
            return Ok(());
        }

        if self.open.len() >= self.capacity {
            if let Some((_, victim)) = self.recency.pop_first() {
                debug!(key = %victim, capacity = self.capacity, "🪂 evicting least recently used part");
                self.stats.evictions += 1;
                // -- 🧮 pop_first already removed the recency entry; close() tolerates that
                self.close(&victim).await?;
            }
        }

        // -- 🔢 parts closed so far IS the next part number. no gaps, no reuse, no drama
        let part = self.part_counts.get(key).copied().unwrap_or(0);
        let name = artifact_name(key, part, self.delivery.compression());
        let sink = self.delivery.open_sink(&name, &OUTPUT_COLUMNS).await?;
        self.open.insert(
            key.to_string(),
            OpenSink {
                part,
                last_used: tick,
                sink,
            },
        );
        self.recency.insert(tick, key.to_string());
        self.stats.parts_opened += 1;
        self.stats.peak_open = self.stats.peak_open.max(self.open.len());
        debug!(key = %key, part, open = self.open.len(), "📂 part opened");
        Ok(())
    }

    fn sink_mut(&mut self, key: &str) -> Result<&mut ArtifactSink> {
        self.open
            .get_mut(key)
            .map(|open| &mut open.sink)
            .context(format!("💀 partition '{key}' was supposed to be open and is not"))
    }
}

/// 🏷️ `in_network_{key}.csv`, then `in_network_{key}.part{n}.csv` for later parts.
pub fn artifact_name(key: &str, part: u32, compression: OutputCompression) -> String {
    let key = sanitize_key(key);
    let extension = compression.extension();
    if part == 0 {
        format!("in_network_{key}{extension}")
    } else {
        format!("in_network_{key}.part{part}{extension}")
    }
}

/// 🧼 Keep `[A-Za-z0-9._-]`, turn everything else into `_`.
pub fn sanitize_key(key: &str) -> Cow<'_, str> {
    let clean = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    // -- 🐄 the common case is already clean, so don't allocate for it
    if key.chars().all(clean) {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(key.chars().map(|c| if clean(c) { c } else { '_' }).collect())
    }
}
