//! 📦 Batch mode: several inputs, one full run each, one table at the end.
//!
//! ```text
//!   --inputs a.json.gz b.json.gz        --batch-file jobs.csv
//!            │ prefix template                    │ input,prefix rows
//!            ▼                                    ▼
//!        [BatchJob { input, prefix }, ...] ──▶ BatchRunner::run
//!            │ per job: work_dir/<stem>, its own prefix, its own manifest and _SUCCESS
//!            ▼
//!        BatchReport ──render──▶ one row per job
//! ```
//!
//! Jobs run one after another. A job that fails is reported and the next one still runs;
//! the batch as a whole is only complete when every job wrote its marker.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
#[cfg(test)]
use crate::backends::ObjectStoreBackend;
use crate::errors::MrfxError;
use crate::progress::{format_duration, format_number};
use crate::summary::RunSummary;
use crate::supervisors::Supervisor;

/// Default for `--prefix-template`.
pub const DEFAULT_PREFIX_TEMPLATE: &str = "{base}/{stem}";

const KNOWN_SUFFIXES: [&str; 5] = [".json.gz", ".ndjson.gz", ".gz", ".json", ".ndjson"];

/// One input and where its artifacts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub input: PathBuf,
    pub prefix: String,
}

/// 🏷️ File name minus its data suffix, scrubbed down to `[A-Za-z0-9_-]`.
///
/// `2026-10_in-network.json.gz` → `2026-10_in-network`, `rates v2.json` → `rates_v2`.
pub fn safe_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // -- 🪓 only the first suffix that matches comes off: `x.json.gz` loses both, `x.gz.json` only `.json`
    let stem = KNOWN_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(&name);
    stem.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 🧩 Fill `{base}`, `{stem}`, `{name}` and `{parent}` in a prefix template.
pub fn derive_prefix(template: &str, base: &str, input: &Path) -> Result<String, MrfxError> {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = input
        .parent()
        .and_then(Path::file_name)
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = template
        .replace("{base}", base)
        .replace("{stem}", &safe_stem(input))
        .replace("{name}", &name)
        .replace("{parent}", &parent);
    if prefix.contains('{') || prefix.contains('}') {
        return Err(MrfxError::Config(format!(
            "prefix template '{template}' has a token other than {{base}}, {{stem}}, {{name}}, {{parent}}"
        )));
    }
    // -- 🧽 an empty {base} leaves "/stem"; keys never start with a slash
    Ok(prefix.trim_matches('/').to_string())
}

/// One job per input, prefixes from the template.
pub fn jobs_from_inputs(inputs: &[PathBuf], template: &str, base: &str) -> Result<Vec<BatchJob>> {
    inputs
        .iter()
        .map(|input| {
            Ok(BatchJob {
                input: input.clone(),
                prefix: derive_prefix(template, base, input)?,
            })
        })
        .collect()
}

/// 📄 Read a batch file: rows of `input,prefix`, comma or tab separated, header optional.
///
/// The header is recognized by its first cell mentioning `input`. A row with only one
/// column is refused, since a job without a prefix would write over the bucket root.
pub fn read_batch_file(path: &Path) -> Result<Vec<BatchJob>> {
    let text = std::fs::read_to_string(path)
        .context(format!("💀 The batch file '{}' could not be read.", path.display()))?;
    parse_batch_file(&text).context(format!("💀 The batch file '{}' is not usable.", path.display()))
}

fn parse_batch_file(text: &str) -> Result<Vec<BatchJob>> {
    let first_line = text.lines().find(|line| !line.trim().is_empty()).unwrap_or_default();
    let delimiter = if first_line.contains('\t') && !first_line.contains(',') {
        b'\t'
    } else {
        b','
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut jobs = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.context("💀 a batch row could not be parsed")?;
        let cells: Vec<&str> = record.iter().collect();
        if cells.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        if index == 0 && cells[0].to_ascii_lowercase().contains("input") {
            continue;
        }
        match cells.as_slice() {
            [input, prefix, ..] if !input.is_empty() => jobs.push(BatchJob {
                input: PathBuf::from(input),
                prefix: prefix.trim_matches('/').to_string(),
            }),
            _ => {
                return Err(MrfxError::Config(format!(
                    "batch row {} needs an input and a prefix, got '{}'",
                    index + 1,
                    cells.join(",")
                ))
                .into());
            }
        }
    }
    if jobs.is_empty() {
        return Err(MrfxError::Config("the batch file lists no jobs".to_string()).into());
    }
    Ok(jobs)
}

/// 🏃 Runs jobs in order with a shared base config.
pub struct BatchRunner {
    base: AppConfig,
    cleanup_local: bool,
    #[cfg(test)]
    store_override: Option<ObjectStoreBackend>,
}

impl BatchRunner {
    pub fn new(base: AppConfig, cleanup_local: bool) -> Self {
        Self {
            base,
            cleanup_local,
            #[cfg(test)]
            store_override: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_store(mut self, store: ObjectStoreBackend) -> Self {
        self.store_override = Some(store);
        self
    }

    /// The config one job runs with: base config, its input, its prefix, its own work dir.
    fn config_for(&self, job: &BatchJob) -> AppConfig {
        let mut config = self.base.clone();
        config.input.file_name = job.input.clone();
        config.output.prefix = job.prefix.clone();
        config.output.work_dir = self.base.output.work_dir.join(safe_stem(&job.input));
        config
    }

    fn supervisor(&self, config: AppConfig) -> Supervisor {
        let supervisor = Supervisor::new(config);
        #[cfg(test)]
        let supervisor = match &self.store_override {
            Some(store) => supervisor.with_store(store.clone()),
            None => supervisor,
        };
        supervisor
    }

    pub async fn run(&self, jobs: Vec<BatchJob>) -> BatchReport {
        let started = Instant::now();
        let total = jobs.len();
        let mut runs = Vec::with_capacity(total);

        for (index, job) in jobs.into_iter().enumerate() {
            let config = self.config_for(&job);
            let work_dir = config.output.work_dir.clone();
            info!(
                job = index + 1,
                of = total,
                input = %job.input.display(),
                prefix = %job.prefix,
                work_dir = %work_dir.display(),
                "📦 starting batch job"
            );

            let outcome = self.supervisor(config).run().await;
            match &outcome {
                Ok(summary) if summary.is_complete() => {
                    if self.cleanup_local {
                        remove_work_dir(&work_dir).await;
                    }
                }
                Ok(_) => {
                    // -- 🛟 staged copies of undelivered parts live in there; never clean those up
                    warn!(input = %job.input.display(), "⚠️ batch job finished incomplete, keeping its work dir");
                }
                Err(e) => {
                    error!(input = %job.input.display(), error = %format!("{e:#}"), "💀 batch job failed, moving on");
                }
            }
            runs.push(BatchRun { job, outcome });
        }

        BatchReport {
            runs,
            elapsed: started.elapsed(),
        }
    }
}

async fn remove_work_dir(work_dir: &Path) {
    match tokio::fs::remove_dir_all(work_dir).await {
        Ok(()) => info!(work_dir = %work_dir.display(), "🧹 cleaned up local work dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(work_dir = %work_dir.display(), error = %e, "⚠️ work dir cleanup failed"),
    }
}

/// One job and how it went.
#[derive(Debug)]
pub struct BatchRun {
    pub job: BatchJob,
    pub outcome: Result<RunSummary>,
}

/// 🧾 Every job of a batch.
#[derive(Debug)]
pub struct BatchReport {
    pub runs: Vec<BatchRun>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|run| run.outcome.is_err()).count()
    }

    pub fn incomplete(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| matches!(&run.outcome, Ok(summary) if !summary.is_complete()))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0 && self.incomplete() == 0
    }

    /// 🍽️ One row per job.
    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["📦 input", "prefix", "records", "rows written", "parts", "status"]);
        for run in &self.runs {
            let (records, rows, parts, status) = match &run.outcome {
                Ok(summary) => (
                    format_number(summary.counters.records_seen),
                    format_number(summary.counters.rows_written),
                    format_number(summary.pool.parts_closed),
                    if summary.is_complete() {
                        "✅ complete".to_string()
                    } else {
                        format!("⚠️ {} undelivered", summary.delivery.undelivered.len())
                    },
                ),
                Err(e) => ("-".into(), "-".into(), "-".into(), format!("❌ {e}")),
            };
            table.add_row(vec![
                Cell::new(run.job.input.display()),
                Cell::new(&run.job.prefix),
                Cell::new(records).set_alignment(CellAlignment::Right),
                Cell::new(rows).set_alignment(CellAlignment::Right),
                Cell::new(parts).set_alignment(CellAlignment::Right),
                Cell::new(status),
            ]);
        }
        table.add_row(vec![
            Cell::new(format!("{} jobs", self.runs.len())),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(format_duration(self.elapsed)),
        ]);
        table.to_string()
    }
}
