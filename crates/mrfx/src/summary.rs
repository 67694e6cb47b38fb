//! 🧾 Run summary: what happened, in numbers, for humans and for machines.
//!
//! - `RunCounters`: every count the run keeps, in one flat struct.
//! - `Manifest`: the JSON written next to the artifacts. Downstream jobs read it to
//!   know which parts exist and whether anything went missing.
//! - `RunSummary`: what `run()` hands back. The CLI renders it as a table.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;

use crate::delivery::{DeliveredArtifact, DeliveryReport, DeliveryStrategy, UndeliveredArtifact};
use crate::progress::{format_duration, format_number};
use crate::resolver::{ResolverStats, UnresolvedReason};
use crate::writer_pool::PoolStats;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const SUCCESS_MARKER_NAME: &str = "_SUCCESS";

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunCounters {
    pub records_seen: u64,
    pub records_kept: u64,
    pub records_filtered: u64,
    pub records_malformed: u64,
    pub rates_with_references: u64,
    /// Rows handed to the writer pool.
    pub rows_emitted: u64,
    /// Rows inside artifacts that actually landed in the store.
    pub rows_written: u64,
    pub rows_discarded: u64,
    pub reference_entries_indexed: u64,
    pub reference_entries_duplicate: u64,
    pub reference_entries_malformed: u64,
    pub ids_requested: u64,
    pub ids_resolved: u64,
    pub ids_unresolved: BTreeMap<UnresolvedReason, u64>,
    pub unresolved_log_rows: u64,
    pub locations_fetched: u64,
    pub fetch_attempts: u64,
}

impl RunCounters {
    pub fn absorb_resolver(&mut self, stats: &ResolverStats) {
        self.ids_requested = stats.ids_requested;
        self.ids_resolved = stats.ids_resolved;
        self.ids_unresolved = stats.ids_unresolved.clone();
        self.locations_fetched = stats.locations_fetched;
        self.fetch_attempts = stats.fetch_attempts;
    }

    pub fn ids_unresolved_total(&self) -> u64 {
        self.ids_unresolved.values().sum()
    }
}

/// 📜 `manifest.json`.
#[derive(Debug, Serialize)]
pub struct Manifest<'a> {
    pub tool: &'static str,
    pub version: &'static str,
    pub input: String,
    pub destination: &'a str,
    pub strategy: DeliveryStrategy,
    pub columns: &'a [&'a str],
    pub counters: &'a RunCounters,
    pub part_counts: &'a BTreeMap<String, u32>,
    pub peak_open_sinks: usize,
    pub evictions: u64,
    pub delivered: &'a [DeliveredArtifact],
    pub undelivered: &'a [UndeliveredArtifact],
}

impl Manifest<'_> {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("💀 the manifest would not serialize")
    }
}

/// 🏁 The result of a run that got far enough to deliver things.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub counters: RunCounters,
    pub pool: PoolStats,
    pub part_counts: BTreeMap<String, u32>,
    pub delivery: DeliveryReport,
    pub manifest_delivered: bool,
    pub marker_written: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Complete means `_SUCCESS` exists.
    pub fn is_complete(&self) -> bool {
        self.marker_written
    }

    /// 🍽️ A two-column table for the terminal.
    pub fn render(&self) -> String {
        let c = &self.counters;
        let mut rows: Vec<(String, String)> = vec![
            ("records seen".into(), format_number(c.records_seen)),
            ("records kept".into(), format_number(c.records_kept)),
            ("records filtered".into(), format_number(c.records_filtered)),
            ("records malformed".into(), format_number(c.records_malformed)),
            ("rows emitted".into(), format_number(c.rows_emitted)),
            ("rows written".into(), format_number(c.rows_written)),
            ("rows discarded".into(), format_number(c.rows_discarded)),
            ("partition keys".into(), format_number(self.part_counts.len() as u64)),
            ("parts written".into(), format_number(self.pool.parts_closed)),
            ("peak open parts".into(), format_number(self.pool.peak_open as u64)),
            ("evictions".into(), format_number(self.pool.evictions)),
            ("reference entries".into(), format_number(c.reference_entries_indexed)),
            ("reference ids requested".into(), format_number(c.ids_requested)),
            ("reference ids resolved".into(), format_number(c.ids_resolved)),
            ("fetch attempts".into(), format_number(c.fetch_attempts)),
        ];
        for (reason, count) in &c.ids_unresolved {
            rows.push((format!("unresolved: {}", reason.as_str()), format_number(*count)));
        }
        rows.push(("delivery".into(), format!("{} → {}", self.delivery.strategy, self.delivery.destination)));
        rows.push(("artifacts delivered".into(), format_number(self.delivery.delivered.len() as u64)));
        rows.push((
            "artifacts undelivered".into(),
            format_number(self.delivery.undelivered.len() as u64),
        ));
        rows.push((
            "complete".into(),
            if self.is_complete() { "✅ yes".into() } else { "❌ no".into() },
        ));
        rows.push(("elapsed".into(), format_duration(self.elapsed)));

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["🧾 mrfx run", ""]);
        for (label, value) in rows {
            table.add_row(vec![Cell::new(label), Cell::new(value).set_alignment(CellAlignment::Right)]);
        }
        for artifact in &self.delivery.undelivered {
            let location = artifact
                .local_path
                .as_ref()
                .map(|path| format!(" (kept at {})", path.display()))
                .unwrap_or_default();
            table.add_row(vec![
                Cell::new(format!("❌ {}", artifact.key)),
                Cell::new(format!("{}{location}", artifact.reason)),
            ]);
        }
        table.to_string()
    }
}
