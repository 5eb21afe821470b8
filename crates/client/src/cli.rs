// crates/client/src/cli.rs
//! `jobwatch` commands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::debug;

use jobwatch_core::{
    AbortCoordinator, AbortDecision, Config, Confirm, DownloadOptions, Job, JobBroker, JobOperator, JobPanel,
    JobTransport, ProgressConfig, ProgressEvent, ProgressSession,
};

use crate::confirm::{PreConfirmed, StdinConfirm};
use crate::ws::WsTransport;

#[derive(Debug, Parser)]
#[command(name = "jobwatch", version, about = "Watch and control backend jobs")]
pub struct Cli {
    /// Config file (default: <config dir>/jobwatch/jobwatch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// WebSocket endpoint, overrides the config file
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List known jobs with running/waiting/failed counts
    List,
    /// Follow one job until it finishes (Ctrl-C closes the view)
    Watch {
        id: u64,
        /// Tail the job log instead of showing a progress bar
        #[arg(long)]
        logs: bool,
        #[arg(long)]
        title: Option<String>,
    },
    /// Abort a running job
    Abort {
        id: u64,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Start a job and follow it
    Run {
        method: String,
        /// JSON params, e.g. '["tank"]'
        params: Option<String>,
        #[arg(long)]
        logs: bool,
        /// Pass the job result to the download method under this name
        #[arg(long)]
        download_arg: Option<String>,
        #[arg(long, default_value = "core.download")]
        download_method: String,
    },
}

/// Exit code for a view that ended in failure.
const EXIT_FAILED: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Load configuration with command line overrides applied.
pub fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(url) = &cli.url {
        config.connection.url = url.clone();
    }
    Ok(config)
}

struct Services {
    transport: Arc<dyn JobTransport>,
    broker: JobBroker,
    abort: AbortCoordinator,
}

impl Services {
    fn new(transport: Arc<dyn JobTransport>, config: &Config, confirm: Arc<dyn Confirm>) -> Self {
        let broker = JobBroker::new(Arc::clone(&transport), config.broker.clone());
        let abort = AbortCoordinator::new(Arc::clone(&transport), confirm);
        Self {
            transport,
            broker,
            abort,
        }
    }

    fn panel(&self) -> JobPanel {
        JobPanel::new(self.broker.clone(), Arc::clone(&self.transport), self.abort.clone())
    }

    fn operator(&self) -> JobOperator {
        JobOperator::new(Arc::clone(&self.transport), self.broker.clone(), self.abort.clone())
    }
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<ExitCode> {
    let transport = WsTransport::connect_with_retry(&config.connection)
        .await
        .with_context(|| format!("cannot reach job service at {}", config.connection.url))?;
    let transport: Arc<dyn JobTransport> = Arc::new(transport);
    execute(cli.command, transport, &config).await
}

/// Run one command against an already connected transport.
pub async fn execute(command: Command, transport: Arc<dyn JobTransport>, config: &Config) -> anyhow::Result<ExitCode> {
    let confirm: Arc<dyn Confirm> = match &command {
        Command::Abort { yes: true, .. } => Arc::new(PreConfirmed),
        _ => Arc::new(StdinConfirm),
    };
    let services = Services::new(transport, config, confirm);

    match command {
        Command::List => list(&services).await,
        Command::Watch { id, logs, title } => {
            let mut progress = ProgressConfig::from_logs(&config.logs).with_logs(logs);
            progress.title = title;
            let session = services.operator().observe(id, progress);
            render(session).await
        }
        Command::Abort { id, .. } => abort(&services, id).await,
        Command::Run {
            method,
            params,
            logs,
            download_arg,
            download_method,
        } => {
            let params: Value = match params.as_deref() {
                Some(text) => serde_json::from_str(text).context("params must be valid JSON")?,
                None => Value::Null,
            };
            let mut progress = ProgressConfig::from_logs(&config.logs).with_logs(logs);
            if let Some(name) = download_arg {
                progress = progress.with_download(DownloadOptions::new(download_method).with_result_as(name));
            }
            let session = services.operator().start(&method, params, progress).await?;
            eprintln!("  started job {}", session.job_id());
            render(session).await
        }
    }
}

async fn list(services: &Services) -> anyhow::Result<ExitCode> {
    let panel = services.panel();
    panel.load().await?;
    for job in panel.jobs() {
        println!("{}", format_row(&job));
    }
    println!(
        "running: {}  waiting: {}  failed: {}",
        panel.running_count(),
        panel.waiting_count(),
        panel.failed_count()
    );
    panel.panel_closed();
    Ok(ExitCode::SUCCESS)
}

async fn abort(services: &Services, id: u64) -> anyhow::Result<ExitCode> {
    let panel = services.panel();
    panel.load().await?;
    let Some(job) = panel.job_by_id(id) else {
        panel.panel_closed();
        bail!("job {id} not found");
    };
    let decision = panel.abort_requested(&job).await;
    panel.panel_closed();

    match decision? {
        AbortDecision::Requested => {
            println!("abort requested for job {id}");
            Ok(ExitCode::SUCCESS)
        }
        AbortDecision::Declined => {
            println!("not aborted");
            Ok(ExitCode::SUCCESS)
        }
        AbortDecision::NotAbortable => {
            eprintln!("job {id} ({}) cannot be aborted in state {}", job.method, job.state());
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}

pub fn format_row(job: &Job) -> String {
    let percent = job
        .progress()
        .and_then(|p| p.percent)
        .map(|p| format!("{p:>5.1}%"))
        .unwrap_or_else(|| "      ".into());
    format!(
        "{:>6}  {:<8} {}  {}  {}",
        job.id,
        job.state(),
        percent,
        job.method,
        job.description.as_deref().unwrap_or("")
    )
}

fn bar_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template("  {bar:40.cyan/blue} {pos:>3}% {msg}")?.progress_chars("##-"))
}

fn spinner_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("  {spinner} {msg}")?)
}

/// Render a progress session on the terminal until it ends.
async fn render(mut session: ProgressSession) -> anyhow::Result<ExitCode> {
    let handle = session.handle();
    let bar = ProgressBar::new(100);
    bar.set_style(spinner_style()?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut exit = ExitCode::SUCCESS;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                match event {
                    ProgressEvent::Progress(update) => {
                        let mut message = update.title.clone();
                        if let Some(description) = &update.description {
                            message = format!("{message}: {description}");
                        }
                        if update.is_aborting {
                            message.push_str(" (aborting)");
                        }
                        match update.percent_complete {
                            Some(percent) => {
                                bar.set_style(bar_style()?);
                                bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
                            }
                            None => bar.set_style(spinner_style()?),
                        }
                        bar.set_message(message);
                    }
                    ProgressEvent::Log(text) => bar.suspend(|| print!("{text}")),
                    ProgressEvent::Success(job) => {
                        bar.finish_with_message(format!("job {} finished", job.id));
                        if let Some(result) = job.result().filter(|r| !r.is_null()) {
                            println!("{result}");
                        }
                    }
                    ProgressEvent::DownloadRequested(request) => {
                        println!("{}", serde_json::to_string(&request)?);
                    }
                    ProgressEvent::Failure(job) => {
                        bar.abandon_with_message(format!("job {} {}", job.id, job.state()));
                        if let Some(failure) = job.failure() {
                            eprintln!("  \u{2717} {}", failure.message.as_deref().unwrap_or("unknown error"));
                            if let Some(exception) = &failure.exception {
                                eprintln!("{exception}");
                            }
                        }
                        exit = ExitCode::from(EXIT_FAILED);
                    }
                    ProgressEvent::Aborted(job) => {
                        bar.abandon_with_message(format!("job {} aborted", job.id));
                        exit = ExitCode::from(EXIT_ABORTED);
                    }
                    ProgressEvent::TransportFailure(e) => {
                        bar.abandon_with_message("connection lost");
                        eprintln!("  \u{2717} {e}");
                        exit = ExitCode::from(EXIT_FAILED);
                    }
                    ProgressEvent::AbortFailed(e) => bar.println(format!("  \u{2717} {e}")),
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                debug!(job_id = session.job_id(), "interrupted; closing view");
                interrupted = true;
                handle.close();
                bar.abandon_with_message("closed (job keeps running)");
                exit = ExitCode::from(EXIT_INTERRUPTED);
            }
        }
    }

    session.finish().await;
    Ok(exit)
}
