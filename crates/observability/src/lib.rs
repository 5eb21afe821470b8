//! Tracing setup shared by the jobwatch binaries.
//!
//! One stderr layer (compact or JSON) plus, when `telemetry.log_dir` is set,
//! a daily-rolling JSON file written from a background thread.

use anyhow::Context;
use jobwatch_core::config::{LogFormat, TelemetryConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// File name prefix of the rolling log.
pub const LOG_FILE_PREFIX: &str = "jobwatch.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer alive. Drop it last so buffered lines are flushed.
#[must_use = "dropping the guard stops the log file writer"]
pub struct TelemetryGuard {
    file: Option<WorkerGuard>,
}

impl TelemetryGuard {
    pub fn has_file_output(&self) -> bool {
        self.file.is_some()
    }
}

/// `RUST_LOG` wins over the configured directives.
pub fn build_filter(config: &TelemetryConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter)
        .with_context(|| format!("invalid log filter {:?}", config.filter))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let filter = build_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(match config.format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let mut file_guard = None;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("a tracing subscriber is already installed")?;

    tracing::debug!(
        format = ?config.format,
        log_dir = ?config.log_dir,
        "tracing initialised"
    );
    Ok(TelemetryGuard { file: file_guard })
}
