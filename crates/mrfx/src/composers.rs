//! 🎼 Composers: turning rows into bytes a spreadsheet would be proud of.
//!
//! 🧠 Knowledge graph:
//! - **CSV** (`CsvComposer`): plain delimited text, header first.
//! - **CSV + gzip** (`GzipCsvComposer`): same rows, squished on the way out.
//! - Resolution: `ComposerBackend::new(compression, header)`, same trait → concrete →
//!   enum-dispatch pattern as the stores.
//!
//! ```text
//!   FlatRow ──compose_row──▶ [batch buffer] ──drain──▶ bytes ──▶ ArtifactSink target
//!                                           └─finish─▶ last bytes (gzip trailer included)
//! ```
//!
//! A composer never touches I/O. It hands out bytes and forgets them. 🦆

mod csv_rows;
mod gzip_csv;

pub(crate) use csv_rows::CsvComposer;
pub(crate) use gzip_csv::GzipCsvComposer;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 🫁 Output encoding for every artifact of a run.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCompression {
    #[default]
    None,
    Gzip,
}

impl OutputCompression {
    /// File extension, dot included.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputCompression::None => ".csv",
            OutputCompression::Gzip => ".csv.gz",
        }
    }
}

/// 🎼 Accepts serializable rows and hands back encoded bytes in chunks.
pub(crate) trait Composer: std::fmt::Debug + Send {
    /// Encode one row into the internal batch.
    fn compose_row<S: Serialize>(&mut self, row: &S) -> Result<()>;
    /// Rows encoded since the last drain.
    fn buffered_rows(&self) -> usize;
    /// Take every byte produced so far. May be empty (gzip likes to hoard).
    fn drain(&mut self) -> Result<Vec<u8>>;
    /// Take the remaining bytes and end the stream.
    fn finish(self) -> Result<Vec<u8>>;
}

/// 🎭 The dispatcher. One variant per output encoding.
#[derive(Debug)]
pub(crate) enum ComposerBackend {
    Csv(CsvComposer),
    GzipCsv(GzipCsvComposer),
}

impl ComposerBackend {
    pub(crate) fn new(compression: OutputCompression, header: &[&str]) -> Result<Self> {
        Ok(match compression {
            OutputCompression::None => ComposerBackend::Csv(CsvComposer::new(header)?),
            OutputCompression::Gzip => ComposerBackend::GzipCsv(GzipCsvComposer::new(header)?),
        })
    }
}

impl Composer for ComposerBackend {
    fn compose_row<S: Serialize>(&mut self, row: &S) -> Result<()> {
        match self {
            ComposerBackend::Csv(c) => c.compose_row(row),
            ComposerBackend::GzipCsv(c) => c.compose_row(row),
        }
    }

    fn buffered_rows(&self) -> usize {
        match self {
            ComposerBackend::Csv(c) => c.buffered_rows(),
            ComposerBackend::GzipCsv(c) => c.buffered_rows(),
        }
    }

    fn drain(&mut self) -> Result<Vec<u8>> {
        match self {
            ComposerBackend::Csv(c) => c.drain(),
            ComposerBackend::GzipCsv(c) => c.drain(),
        }
    }

    fn finish(self) -> Result<Vec<u8>> {
        match self {
            ComposerBackend::Csv(c) => c.finish(),
            ComposerBackend::GzipCsv(c) => c.finish(),
        }
    }
}
