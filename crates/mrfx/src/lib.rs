//! 🦀 mrfx: stream a payer's in-network MRF file into per-billing-code CSV parts.
//!
//! One pass over the input, bounded memory, at most `runtime.max_open_sinks` parts open
//! at any moment. Provider references are indexed during the pass, resolved once at the
//! end, and replayed through the same fan-out as inline groups.

pub mod app_config;
pub mod backends;
pub mod batch;
pub mod common;
pub mod composers;
pub mod delivery;
pub mod errors;
pub(crate) mod progress;
pub mod resolver;
pub mod retry;
pub mod summary;
pub(crate) mod supervisors;
pub mod transforms;
pub mod writer_pool;

use anyhow::{Context, Result};

pub use app_config::{AppConfig, load_config};
pub use batch::{BatchJob, BatchReport};
pub use errors::MrfxError;
pub use summary::RunSummary;

use crate::batch::BatchRunner;
use crate::supervisors::Supervisor;

/// 🚀 Run one extraction. `Ok` can still be incomplete: check `RunSummary::is_complete`.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    Supervisor::new(app_config)
        .run()
        .await
        .context("💀 The extraction run failed")
}

/// 📦 Run several inputs one after another, each with its own prefix and work dir.
///
/// Never fails as a whole: each job's outcome is in the report.
pub async fn run_batch(app_config: AppConfig, jobs: Vec<BatchJob>, cleanup_local: bool) -> BatchReport {
    BatchRunner::new(app_config, cleanup_local).run(jobs).await
}
