//! 🔧 App Configuration: TOML and env vars in, one validated struct out.
//!
//! 📡 Figment merges `MRFX_*` environment variables (nested with `__`, so
//! `MRFX_RUNTIME__FLUSH_ROWS=500` lands in `runtime.flush_rows`) with an optional TOML
//! file. The file wins on conflicts.
//!
//! Every section except `[input]` and `[delivery]` has defaults, and every backend's
//! config struct lives next to its backend. This file only assembles them and refuses
//! the combinations that can only end badly.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{Decompression, InputConfig};
use crate::delivery::{DeliveryConfig, OutputConfig};
use crate::errors::MrfxError;
use crate::resolver::ResolverConfig;
use crate::retry::RetryConfig;
use crate::transforms::RoutingConfig;
use crate::writer_pool::RotationPolicy;

const ENV_PREFIX: &str = "MRFX_";

/// 📦 Everything a run needs to know about itself.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rotation: RotationPolicy,
    #[serde(default)]
    pub resolver: ResolverConfig,
    pub delivery: DeliveryConfig,
}

/// 🏎️ `[runtime]`: the knobs that trade memory for throughput.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Rows buffered per open part before bytes go to the target.
    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,
    /// Upper bound on simultaneously open parts.
    #[serde(default = "default_max_open_sinks")]
    pub max_open_sinks: usize,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default = "default_progress")]
    pub progress: bool,
}

fn default_flush_rows() -> usize {
    1000
}

fn default_max_open_sinks() -> usize {
    64
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_rows: default_flush_rows(),
            max_open_sinks: default_max_open_sinks(),
            fetch_concurrency: default_fetch_concurrency(),
            upload_concurrency: default_upload_concurrency(),
            progress: default_progress(),
        }
    }
}

impl AppConfig {
    /// 🔒 Refuse configs that would fail later, and louder. Runs before any input is opened.
    pub fn validate(&self) -> Result<(), MrfxError> {
        let mut problems = Vec::new();

        if self.input.file_name.as_os_str().is_empty() {
            problems.push("input.file_name is empty".to_string());
        }
        if let Decompression::Command { program, .. } = &self.input.decompression {
            if program.trim().is_empty() {
                problems.push("input.decompression.Command needs a program".to_string());
            }
        }
        if let Decompression::Pigz { threads: 0 } = self.input.decompression {
            problems.push("input.decompression.Pigz.threads must be at least 1".to_string());
        }
        if self.input.channel_capacity == 0 {
            problems.push("input.channel_capacity must be at least 1".to_string());
        }
        for (name, value) in [
            ("runtime.flush_rows", self.runtime.flush_rows),
            ("runtime.max_open_sinks", self.runtime.max_open_sinks),
            ("runtime.fetch_concurrency", self.runtime.fetch_concurrency),
            ("runtime.upload_concurrency", self.runtime.upload_concurrency),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be at least 1"));
            }
        }
        if !self.retry.backoff.is_finite() || self.retry.backoff < 1.0 {
            problems.push(format!(
                "retry.backoff must be a finite number >= 1.0, got {}",
                self.retry.backoff
            ));
        }
        if let RotationPolicy::RowThreshold { max_rows: 0 } = self.rotation {
            problems.push("rotation.RowThreshold.max_rows must be at least 1".to_string());
        }
        if let Err(problem) = self.delivery.store.validate() {
            problems.push(problem);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MrfxError::Config(problems.join("; ")))
        }
    }
}

/// 🚀 Load the config from `MRFX_*` env vars and, when given, a TOML file.
///
/// No file means env vars only. Parse errors name both sources so nobody has to guess
/// which one lied.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(file = ?config_file_name, env_prefix = ENV_PREFIX, "🔧 loading configuration");

    let config = Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables ({ENV_PREFIX}*). \
             Check that [input] and [delivery.store] are present and spelled the way serde expects.",
            path.display()
        ),
        None => format!(
            "💀 Failed to parse configuration from environment variables ({ENV_PREFIX}*). \
             No file was provided, so input and delivery settings must all come from the environment."
        ),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ObjectStoreConfig;
    use crate::transforms::MatchMode;
    use std::fs;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("mrfx.toml");
        fs::write(&path, contents).expect("💀 test config should be writable");
        path
    }

    #[test]
    fn the_one_where_a_minimal_file_gets_every_default() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = write_test_config(
            &dir,
            r#"
            [input]
            file_name = "in_network.json.gz"

            [delivery.store.LocalDir]
            path = "/tmp/mrfx-out"
            "#,
        );
        let config = load_config(Some(&path)).expect("💀 minimal config should load");

        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.runtime.max_open_sinks, 64);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.routing.key_type, "CPT");
        assert_eq!(config.rotation, RotationPolicy::RecordBoundary);
        assert!(config.resolver.enabled);
        assert!(!config.delivery.force_fallback);
        assert!(config.output.prefix.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn the_one_where_every_section_speaks_up() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = write_test_config(
            &dir,
            r#"
            rotation = "EvictionOnly"

            [input]
            file_name = "in_network.json.gz"
            decompression = { Pigz = { threads = 8 } }

            [output]
            prefix = "payer/2026-10"
            compression = "Gzip"

            [runtime]
            flush_rows = 10
            max_open_sinks = 3
            progress = false

            [retry]
            max_retries = 5
            base_delay_ms = 50

            [routing]
            key_type = "HCPCS"
            match_mode = "Prefix"
            allowlist = "99213, 99214"

            [resolver]
            enabled = false

            [delivery]
            force_fallback = true

            [delivery.store.S3]
            bucket = "prices"
            endpoint_url = "http://localhost:9000"
            force_path_style = true
            "#,
        );
        let config = load_config(Some(&path)).expect("💀 full config should load");

        assert_eq!(config.input.decompression, Decompression::Pigz { threads: 8 });
        assert_eq!(config.runtime.max_open_sinks, 3);
        assert_eq!(config.runtime.upload_concurrency, 4);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.routing.match_mode, MatchMode::Prefix);
        assert_eq!(config.routing.allowlist.as_ref().map(|a| a.len()), Some(2));
        assert_eq!(config.rotation, RotationPolicy::EvictionOnly);
        assert!(!config.resolver.enabled);
        assert!(config.delivery.force_fallback);
        assert!(matches!(config.delivery.store, ObjectStoreConfig::S3(ref s3) if s3.force_path_style));
    }

    #[test]
    fn the_one_where_forgetting_the_destination_is_fatal() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = write_test_config(
            &dir,
            r#"
            [input]
            file_name = "in_network.json.gz"
            "#,
        );
        let err = load_config(Some(&path)).expect_err("💀 no delivery section, no run");
        assert!(format!("{err:#}").contains("mrfx.toml"));
    }

    #[test]
    fn the_one_where_zero_capacity_is_refused_before_anything_opens() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = write_test_config(
            &dir,
            r#"
            [input]
            file_name = "in_network.json.gz"

            [runtime]
            max_open_sinks = 0

            [delivery.store.S3]
            bucket = ""
            "#,
        );
        let config = load_config(Some(&path)).expect("💀 it parses, it just isn't sane");
        match config.validate() {
            Err(MrfxError::Config(message)) => {
                assert!(message.contains("max_open_sinks"));
                assert!(message.contains("bucket"));
            }
            other => panic!("💀 expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_row_threshold_rotation_needs_a_threshold() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = write_test_config(
            &dir,
            r#"
            [input]
            file_name = "in_network.json"

            [rotation.RowThreshold]
            max_rows = 0

            [delivery]
            store = "InMemory"
            "#,
        );
        let config = load_config(Some(&path)).expect("💀 should parse");
        assert!(config.validate().is_err());
    }
}
