//! 📡 Fetchers: how a location URL turns into payload bytes.
//!
//! One attempt per call, classified for the retry loop. The resolver owns retries,
//! dedup and shape checks; a fetcher only knows how to ask.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::ResolverConfig;
use crate::errors::AttemptError;

#[async_trait]
pub trait ReferenceFetcher: std::fmt::Debug + Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AttemptError>;
}

/// 🎭 Enum dispatch over the fetchers.
#[derive(Debug, Clone)]
pub enum FetcherBackend {
    Http(HttpFetcher),
    InMemory(InMemoryFetcher),
}

#[async_trait]
impl ReferenceFetcher for FetcherBackend {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AttemptError> {
        match self {
            FetcherBackend::Http(fetcher) => fetcher.fetch(location).await,
            FetcherBackend::InMemory(fetcher) => fetcher.fetch(location).await,
        }
    }
}

/// 🌐 Plain GET with a connect timeout and a whole-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("💀 The HTTP client refused to be born. Usually a TLS setup problem on this machine. Reference resolution cannot start without it.")?;
        Ok(Self { client })
    }
}

/// Worth another try: the server is having a moment, or asked us to slow down.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_request_error(error: reqwest::Error, location: &str) -> AttemptError {
    let transient = error.is_timeout() || error.is_connect() || error.is_request() || error.is_body();
    let error = anyhow::Error::new(error).context(format!("💀 GET {location}"));
    if transient {
        AttemptError::Transient(error)
    } else {
        AttemptError::Permanent(error)
    }
}

#[async_trait]
impl ReferenceFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AttemptError> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| classify_request_error(e, location))?;
        let status = response.status();
        if !status.is_success() {
            let error = anyhow::anyhow!("💀 GET {location} answered {status}");
            return Err(if is_transient_status(status) {
                AttemptError::Transient(error)
            } else {
                AttemptError::Permanent(error)
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(e, location))?;
        debug!(location, bytes = body.len(), "📥 reference payload fetched");
        Ok(body.to_vec())
    }
}

/// 🧪 Canned payloads keyed by location. Unknown locations are permanent failures.
/// Counts every attempt so tests can check the dedup story.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFetcher {
    payloads: Arc<HashMap<String, Vec<u8>>>,
    attempts: Arc<AtomicU32>,
}

impl InMemoryFetcher {
    pub fn new(payloads: HashMap<String, Vec<u8>>) -> Self {
        Self {
            payloads: Arc::new(payloads),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceFetcher for InMemoryFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AttemptError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .get(location)
            .cloned()
            .ok_or_else(|| AttemptError::permanent(anyhow::anyhow!("🧪 nothing canned for '{location}'")))
    }
}
