//! Quorum CLI - inspect and validate resilience configuration
//!
//! # Usage
//!
//! ```bash
//! # Check a config file and print what it resolves to
//! quorum validate quorum.yaml
//!
//! # Print the built-in defaults
//! quorum defaults --json
//!
//! # Show the backoff a rate-limited call would see
//! quorum backoff rate-limit --config quorum.yaml --samples 5
//!
//! # Verbose logging
//! RUST_LOG=debug quorum validate quorum.yaml
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quorum_core::{CallError, EndpointCategory, ErrorKind, ExhaustionPolicy, QuorumConfig};
use quorum_runtime::RetryExecutor;
use tracing_subscriber::EnvFilter;

/// Quorum - resilience-aware routing and aggregation
#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a config file, then summarize it
    Validate {
        /// Config file (YAML, or JSON with a .json extension)
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },

    /// Print the default configuration
    Defaults {
        /// Emit JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Print the retry schedule for an error kind
    Backoff {
        /// Error kind (transient, rate-limit, execution-transient, ...)
        kind: ErrorKind,

        /// Take the retry table from this config instead of the defaults
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Number of jittered delay sequences to sample
        #[arg(short, long, default_value_t = 3)]
        samples: usize,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Result<QuorumConfig> {
    tracing::debug!(path = %path.display(), "Loading config");
    QuorumConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Validate { config } => {
            let loaded = load(&config)?;
            print!("{}", summarize(&loaded));
            tracing::info!(path = %config.display(), "Config is valid");
        }
        Command::Defaults { json } => {
            let defaults = QuorumConfig::default();
            if json {
                println!("{}", serde_json::to_string_pretty(&defaults)?);
            } else {
                print!("{}", defaults.to_yaml()?);
            }
        }
        Command::Backoff { kind, config, samples } => {
            let config = match config {
                Some(path) => load(&path)?,
                None => QuorumConfig::default(),
            };
            let executor = RetryExecutor::new(config.retry);
            print!("{}", describe_backoff(&executor, kind, samples));
        }
    }
    Ok(())
}

fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

fn summarize(config: &QuorumConfig) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Endpoints: {}", config.endpoints.len());
    for category in EndpointCategory::ALL {
        let ids: Vec<&str> = config
            .endpoints
            .iter()
            .filter(|e| e.category == category)
            .map(|e| e.id.as_str())
            .collect();
        if ids.is_empty() {
            continue;
        }
        let breaker = config.breakers.for_category(category);
        let _ = writeln!(
            out,
            "  {} ({} failures / {}, open {}): {}",
            category,
            breaker.failure_threshold,
            fmt_duration(breaker.failure_window),
            fmt_duration(breaker.open_duration),
            ids.join(", ")
        );
    }

    let _ = writeln!(out, "Tiers: {}", config.tiers.len());
    for (i, tier) in config.tiers.iter().enumerate() {
        let _ = write!(
            out,
            "  {}. {} -> {} (max ${:.4}",
            i + 1,
            tier.name,
            tier.endpoint,
            tier.max_cost
        );
        if let Some(latency) = tier.max_latency {
            let _ = write!(out, ", max latency {}", fmt_duration(latency));
        }
        let _ = writeln!(out, ")");
    }

    let policy = match &config.rotation.on_exhausted {
        ExhaustionPolicy::ClearAndRetry => "clear and retry".to_string(),
        ExhaustionPolicy::Wait { max_wait } => format!("wait up to {}", fmt_duration(*max_wait)),
        ExhaustionPolicy::Fail => "fail".to_string(),
    };
    let _ = writeln!(
        out,
        "Rotation pool: {} endpoints, exclusion {}, when exhausted: {}",
        config.rotation.pool.len(),
        fmt_duration(config.rotation.exclusion),
        policy
    );

    let _ = writeln!(
        out,
        "Ensemble: deadline {}, min producers {}, cache {} entries for {}",
        fmt_duration(config.ensemble.deadline),
        config.ensemble.min_producers,
        config.ensemble.cache_capacity,
        fmt_duration(config.ensemble.cache_ttl)
    );
    let _ = writeln!(out, "Session budget: ${:.2}", config.budget.session_max);
    out
}

/// A representative failure of `kind`, for sampling delays.
fn sample_error(kind: ErrorKind) -> CallError {
    match kind {
        ErrorKind::Transient => CallError::transient("sample", "sample"),
        ErrorKind::RateLimit => CallError::rate_limited("sample", None),
        ErrorKind::ExecutionTransient => CallError::execution("sample", "sample", true),
        ErrorKind::ExecutionRejected => CallError::execution("sample", "sample", false),
        ErrorKind::InferenceTransient => CallError::inference("sample", "sample", true),
        ErrorKind::InferenceFailure => CallError::inference("sample", "sample", false),
        ErrorKind::Validation => CallError::Validation("sample".to_string()),
        ErrorKind::CircuitOpen => CallError::CircuitOpen {
            endpoint: "sample".to_string(),
            retry_in: Duration::ZERO,
        },
    }
}

fn describe_backoff(executor: &RetryExecutor, kind: ErrorKind, samples: usize) -> String {
    let policy = executor.policy_for(kind);
    let mut out = String::new();

    if !kind.is_retryable() {
        let _ = writeln!(out, "{}: never retried", kind);
        return out;
    }

    let _ = writeln!(
        out,
        "{}: {} attempts, base {}, max {}, jitter {}",
        kind,
        policy.attempts(),
        fmt_duration(policy.base_delay),
        fmt_duration(policy.max_delay),
        if policy.jitter { "on" } else { "off" }
    );

    let schedule = executor.schedule(kind);
    if schedule.is_empty() {
        let _ = writeln!(out, "  no retries");
        return out;
    }

    let render = |delays: Vec<Duration>| {
        delays
            .into_iter()
            .map(|d| format!("{:.2}s", d.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(" -> ")
    };
    let _ = writeln!(out, "  schedule: {}", render(schedule.clone()));

    if policy.jitter {
        let error = sample_error(kind);
        for i in 0..samples {
            let delays = (0..schedule.len() as u32)
                .map(|retry| executor.delay_after(&error, retry))
                .collect();
            let _ = writeln!(out, "  sample {}: {}", i + 1, render(delays));
        }
    }
    out
}
