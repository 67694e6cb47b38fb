//! 📊 progress.rs: "Are we there yet?" for a file that does not say how big it is.
//!
//! 🚀 The input is a gzip stream and we only learn its real size at the end, so there is
//! no percentage and no ETA. There is a spinner, a record rate over a sliding window,
//! and a small comfy table with the numbers that matter: records, rows, open parts.
//!
//! ⚠️ Watching the spinner will not make it go faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

/// Re-render every this many records. Rendering per record would cost more than parsing.
const RENDER_EVERY: u64 = 1_000;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 `1234567` → `1,234,567`.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS once a run gets serious.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📊 Spinner plus live counters for the main pass.
pub(crate) struct RunProgress {
    label: String,
    records: u64,
    rows: u64,
    open_parts: usize,
    spinner: ProgressBar,
    samples: VecDeque<(Instant, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for RunProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar has no Debug, and printing one would be a choice anyway
        f.debug_struct("RunProgress")
            .field("label", &self.label)
            .field("records", &self.records)
            .field("rows", &self.rows)
            .finish()
    }
}

impl RunProgress {
    /// `enabled = false` gives a hidden spinner: same calls, no terminal output.
    pub(crate) fn new(label: String, enabled: bool) -> Self {
        let spinner = if enabled {
            let spinner = ProgressBar::new_spinner();
            let style = ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.enable_steady_tick(Duration::from_millis(200));
            spinner
        } else {
            ProgressBar::hidden()
        };
        let start_time = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((start_time, 0));
        Self {
            label,
            records: 0,
            rows: 0,
            open_parts: 0,
            spinner,
            samples,
            start_time,
        }
    }

    /// 🔄 One more record went by. `rows` and `open_parts` are running totals.
    pub(crate) fn record_seen(&mut self, rows: u64, open_parts: usize) {
        self.records += 1;
        self.rows = rows;
        self.open_parts = open_parts;
        if self.records % RENDER_EVERY == 0 {
            let rate = self.records_per_sec();
            self.render(rate);
        }
    }

    /// 💬 Replace the status line, for phases that are not record-shaped (resolving, uploading).
    pub(crate) fn phase(&self, message: &str) {
        self.spinner.set_message(format!("{}: {message}", self.label));
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }

    fn records_per_sec(&mut self) -> f64 {
        let now = Instant::now();
        while let Some(&(timestamp, _)) = self.samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, self.records));
        match self.samples.front() {
            Some(&(oldest, oldest_records)) => {
                let elapsed = now.duration_since(oldest).as_secs_f64();
                if elapsed > 0.0 {
                    self.records.saturating_sub(oldest_records) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn render(&self, records_per_sec: f64) {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} records/s", format_number(records_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} records", format_number(self.records)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} open parts", self.open_parts)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} rows", format_number(self.rows))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
            Cell::new(""),
        ]);
        self.spinner.set_message(format!("{}\n{table}", self.label));
    }
}
