use anyhow::{Context, Result};
use serde::Serialize;

use super::Composer;

/// 🧾 Plain CSV. The header goes into the very first batch and never again.
pub(crate) struct CsvComposer {
    batch: csv::Writer<Vec<u8>>,
    buffered: usize,
}

impl std::fmt::Debug for CsvComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvComposer")
            .field("buffered", &self.buffered)
            .finish()
    }
}

fn fresh_batch() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new())
}

impl CsvComposer {
    pub(crate) fn new(header: &[&str]) -> Result<Self> {
        let mut batch = fresh_batch();
        batch
            .write_record(header)
            .context("💀 The CSV header refused to be written. Twelve column names. Zero cooperation.")?;
        Ok(Self { batch, buffered: 0 })
    }
}

impl Composer for CsvComposer {
    fn compose_row<S: Serialize>(&mut self, row: &S) -> Result<()> {
        self.batch
            .serialize(row)
            .context("💀 A row could not be serialized to CSV. It had one job.")?;
        self.buffered += 1;
        Ok(())
    }

    fn buffered_rows(&self) -> usize {
        self.buffered
    }

    fn drain(&mut self) -> Result<Vec<u8>> {
        let batch = std::mem::replace(&mut self.batch, fresh_batch());
        self.buffered = 0;
        batch
            .into_inner()
            .context("💀 The CSV writer would not let go of its buffer. Separation anxiety.")
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        self.drain()
    }
}
