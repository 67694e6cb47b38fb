//! 🚀 mrfx-cli: the front door. Loads config, sets up logging, hands off to `mrfx::run`.
//!
//! Exit codes: `0` complete, `1` fatal error, `2` finished but something never got
//! delivered (the summary says what, and where the local copy lives). In batch mode a
//! single failed job means `1`, a single incomplete one means `2`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mrfx::MrfxError;
use mrfx::batch::{DEFAULT_PREFIX_TEMPLATE, jobs_from_inputs, read_batch_file};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🎛️ Everything here overrides what the config file says.
#[derive(Debug, Parser)]
#[command(name = "mrfx", version, about = "Stream an in-network MRF file into per-billing-code CSV parts")]
struct Cli {
    /// TOML config. Skipped silently when the default does not exist.
    #[arg(default_value = "mrfx.toml", env = "MRFX_CONFIG")]
    config: PathBuf,

    /// Same as the positional path, for scripts that prefer flags.
    #[arg(long = "config", value_name = "PATH")]
    config_flag: Option<PathBuf>,

    /// Input file, overriding `[input].file_name`.
    #[arg(long, conflicts_with_all = ["inputs", "batch_file"])]
    input: Option<PathBuf>,

    /// Key prefix for every artifact, overriding `[output].prefix`. With `--inputs` it is
    /// the `{base}` of the prefix template.
    #[arg(long)]
    prefix: Option<String>,

    /// Skip the probe and stage parts locally before upload.
    #[arg(long)]
    force_fallback: bool,

    /// Several inputs, run one after another, each under its own prefix.
    #[arg(long, num_args = 1.., value_name = "FILE", conflicts_with = "batch_file")]
    inputs: Option<Vec<PathBuf>>,

    /// CSV or TSV of `input,prefix` rows, header optional.
    #[arg(long, value_name = "PATH")]
    batch_file: Option<PathBuf>,

    /// Per-input prefix for `--inputs`. Tokens: {base}, {stem}, {name}, {parent}.
    #[arg(long, default_value = DEFAULT_PREFIX_TEMPLATE)]
    prefix_template: String,

    /// Delete each batch job's local work dir once the job is complete.
    #[arg(long)]
    cleanup_local: bool,
}

/// 🔧 What to tell a human after a fatal error, judged from the cause chain.
#[derive(Debug, PartialEq)]
enum Hint {
    MissingInput,
    Decompressor { program: String, status: Option<i32> },
    StoreCredentials,
    Config,
}

impl Hint {
    fn from_error(err: &anyhow::Error) -> Option<Hint> {
        for cause in err.chain() {
            match cause.downcast_ref::<MrfxError>() {
                Some(MrfxError::TransportFailure { program, status }) => {
                    return Some(Hint::Decompressor {
                        program: program.clone(),
                        status: *status,
                    });
                }
                Some(MrfxError::Config(_)) => return Some(Hint::Config),
                _ => {}
            }
            if cause
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
            {
                return Some(Hint::MissingInput);
            }
            let text = cause.to_string();
            // -- 🔑 the SDK's error codes survive into the message via DisplayErrorContext
            if ["InvalidAccessKeyId", "SignatureDoesNotMatch", "AccessDenied", "NoSuchBucket", "status: Some(403)"]
                .iter()
                .any(|needle| text.contains(needle))
                || text.contains("no credentials")
                || text.contains("failed to load credentials")
            {
                return Some(Hint::StoreCredentials);
            }
        }
        None
    }

    fn message(&self) -> String {
        match self {
            Hint::MissingInput => "🔧 hint: the input file is not where the config says. Check --input or \
                 [input].file_name; relative paths start from the directory mrfx was launched in."
                .to_string(),
            Hint::Decompressor { program, status } => {
                let status = status.map_or("was killed by a signal".to_string(), |code| format!("exited with {code}"));
                format!(
                    "🔧 hint: the decompressor '{program}' {status}. Make sure it is installed and on PATH \
                     ('{program} --version'), that the input really is gzip, or set \
                     [input].decompression = \"Gzip\" to decompress in-process."
                )
            }
            Hint::StoreCredentials => "🔧 hint: the object store refused us. For R2 set R2_ACCOUNT_ID, \
                 R2_BUCKET_NAME, R2_ACCESS_KEY_ID and R2_ACCESS_KEY_SECRET (or the matching keys in \
                 [delivery.store.R2]); for S3 check access_key_id, secret_access_key and the bucket name."
                .to_string(),
            Hint::Config => "🔧 hint: fix the settings named above in the config file or with MRFX_* env \
                 vars (nested keys use '__', e.g. MRFX_RUNTIME__FLUSH_ROWS=500)."
                .to_string(),
        }
    }
}

fn report_fatal(err: &anyhow::Error) {
    error!("💀 error: {}", err);
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
    }
    if let Some(hint) = Hint::from_error(err) {
        error!("{}", hint.message());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config_flag.clone().unwrap_or_else(|| cli.config.clone());

    // 🔒 A missing file is fine (env vars only); an unreadable path is not.
    let config_file = match config_path.try_exists().context(format!(
        "💀 Couldn't check whether the configuration file exists. If the path is relative, \
         try an absolute one. Was checking here: '{}'",
        config_path.display()
    ))? {
        true => Some(config_path.as_path()),
        false => None,
    };

    let mut app_config = mrfx::load_config(config_file)
        .context("💀 In mrfx-cli, main, we couldn't load the configuration. Check [input] and [delivery.store] first.")?;
    if let Some(input) = &cli.input {
        app_config.input.file_name = input.clone();
    }
    if let Some(prefix) = &cli.prefix {
        app_config.output.prefix = prefix.clone();
    }
    if cli.force_fallback {
        app_config.delivery.force_fallback = true;
    }

    let jobs = match (&cli.batch_file, &cli.inputs) {
        (Some(batch_file), _) => Some(read_batch_file(batch_file)),
        (None, Some(inputs)) => Some(jobs_from_inputs(
            inputs,
            &cli.prefix_template,
            &app_config.output.prefix,
        )),
        (None, None) => None,
    };
    if let Some(jobs) = jobs {
        let jobs = match jobs {
            Ok(jobs) => jobs,
            Err(err) => {
                report_fatal(&err);
                std::process::exit(1);
            }
        };
        let report = mrfx::run_batch(app_config, jobs, cli.cleanup_local).await;
        println!("{}", report.render());
        for run in &report.runs {
            if let Err(err) = &run.outcome {
                report_fatal(err);
            }
        }
        if report.failed() > 0 {
            std::process::exit(1);
        }
        if report.incomplete() > 0 {
            error!(incomplete = report.incomplete(), "⚠️ some batch jobs finished without a completion marker");
            std::process::exit(2);
        }
        return Ok(());
    }

    let summary = match mrfx::run(app_config).await {
        Ok(summary) => summary,
        Err(err) => {
            report_fatal(&err);
            std::process::exit(1);
        }
    };

    println!("{}", summary.render());
    if !summary.is_complete() {
        error!(
            undelivered = summary.delivery.undelivered.len(),
            "⚠️ run finished without a completion marker"
        );
        std::process::exit(2);
    }
    Ok(())
}
