//! 💀 errors.rs: the taxonomy of sadness, now with first and last names.
//!
//! 🧠 Knowledge graph: application code speaks `anyhow` (context strings all the way down),
//! but the failures that change what the run DOES get a typed variant here so the
//! supervisor and the CLI can `downcast_ref` and react instead of string-sniffing.
//!
//! - `Config`            → fatal before the input is even opened
//! - `TransportFailure`  → decompressor died; fatal after best-effort flush
//! - `MalformedDocument` → the JSON itself is broken; fatal, same treatment
//!
//! Retried operations that give up return a `RetryError` instead. Callers decide whether
//! that is fatal (almost never) or a line in the report (almost always).
//!
//! Malformed records and unresolved references are NOT errors. They are counters.
//! Counters don't get stack traces. Counters get a row in the summary table. 🦆

use thiserror::Error;

/// 🏷️ Failures that terminate or reshape the run.
#[derive(Debug, Error)]
pub enum MrfxError {
    /// 🔧 Bad or missing configuration. Raised before any stream is opened.
    #[error("💀 configuration error: {0}")]
    Config(String),

    /// 🚰 The decompression transport exited abnormally.
    /// `status` is `None` when the process was killed by a signal.
    #[error("💀 transport '{program}' exited abnormally (status: {status:?})")]
    TransportFailure {
        program: String,
        status: Option<i32>,
    },

    /// 🧩 The document stopped being JSON somewhere along the way.
    #[error("💀 input document is malformed: {0}")]
    MalformedDocument(String),
}

/// 🎲 The outcome of ONE attempt, as judged by whoever made it.
///
/// `Transient` means "try again, the universe might be kinder in 1.5 seconds".
/// `Permanent` means "no amount of waiting fixes a 404".
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),
    #[error("permanent: {0:#}")]
    Permanent(anyhow::Error),
}

impl AttemptError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        AttemptError::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        AttemptError::Permanent(error.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }
}

/// 🪦 Why a retried operation stopped retrying.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("💀 {operation} gave up after {attempts} attempts: {last_error:#}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: anyhow::Error,
    },
    #[error("💀 {operation} failed permanently on attempt {attempts}: {last_error:#}")]
    Permanent {
        operation: String,
        attempts: u32,
        last_error: anyhow::Error,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }
}
