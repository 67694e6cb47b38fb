use std::io::Write;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use super::{Composer, CsvComposer};

/// 🫁 CSV rows piped through one gzip member per artifact.
///
/// `drain` hands out whatever compressed bytes exist so far. The encoder keeps its
/// window, so the concatenation of every drain plus `finish` is one valid gzip stream.
pub(crate) struct GzipCsvComposer {
    rows: CsvComposer,
    gzip: GzEncoder<Vec<u8>>,
}

impl std::fmt::Debug for GzipCsvComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipCsvComposer")
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl GzipCsvComposer {
    pub(crate) fn new(header: &[&str]) -> Result<Self> {
        Ok(Self {
            rows: CsvComposer::new(header)?,
            gzip: GzEncoder::new(Vec::new(), Compression::default()),
        })
    }
}

impl Composer for GzipCsvComposer {
    fn compose_row<S: Serialize>(&mut self, row: &S) -> Result<()> {
        self.rows.compose_row(row)
    }

    fn buffered_rows(&self) -> usize {
        self.rows.buffered_rows()
    }

    fn drain(&mut self) -> Result<Vec<u8>> {
        let plain = self.rows.drain()?;
        self.gzip
            .write_all(&plain)
            .context("💀 gzip choked on a batch of CSV. It was only text. It was ONLY TEXT.")?;
        Ok(std::mem::take(self.gzip.get_mut()))
    }

    fn finish(self) -> Result<Vec<u8>> {
        let Self { rows, mut gzip } = self;
        let plain = rows.finish()?;
        gzip.write_all(&plain)
            .context("💀 gzip choked on the final CSV batch.")?;
        gzip.finish()
            .context("💀 gzip could not write its trailer. The file ends mid-sentence.")
    }
}
