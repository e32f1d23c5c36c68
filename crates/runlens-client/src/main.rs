//! Runlens - follow plan/apply runs from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use runlens_client::config::Config;
use runlens_client::logging::{self, LogConfig, LogFormat};
use runlens_client::{
    ApiClient, LogType, MonitorOptions, MonitorView, PollOptions, RunMonitor,
    StreamClient, StreamOptions, StreamRegistry, StreamVariant, WsConnector,
};
use runlens_core::{partition_text, StageLog};
use runlens_types::{ConnectionStatus, TaskStatus};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

/// Runlens - live view of infrastructure plan/apply runs.
#[derive(Parser, Debug)]
#[command(name = "runlens")]
#[command(about = "Follow plan/apply runs: stages, logs and resource status")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL from config
    #[arg(long, value_name = "URL", global = true)]
    api_url: Option<String>,

    /// Bearer token for the API and the live stream
    #[arg(long, env = "RUNLENS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Enable verbose logging (INFO level for most targets)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging (DEBUG level, excludes per-frame traces)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable trace logging (TRACE level for everything)
    #[arg(long, global = true)]
    trace: bool,

    /// Quiet mode (WARN and ERROR only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "stream=debug" or "stream::frames=trace").
    /// Can be specified multiple times. Targets are prefixed with "runlens::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL", global = true)]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a run until it finishes
    Watch {
        /// Workspace id
        #[arg(short, long)]
        workspace: String,

        /// Task id
        task: u64,

        /// Print every view change as a JSON line
        #[arg(long)]
        json: bool,

        /// Do not print live log lines
        #[arg(long)]
        no_logs: bool,
    },
    /// Fetch a run's log and print it split by stage
    Logs {
        /// Task id
        task: u64,

        /// Which section of the log to fetch
        #[arg(long = "type", value_enum, default_value = "all")]
        log_type: LogType,

        /// Only print this stage (e.g. "planning")
        #[arg(long)]
        stage: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config)?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    tracing::info!(target: "runlens::startup", api = %config.api_base_url, "Loaded configuration");

    let api = Arc::new(ApiClient::new(
        &config.api_base_url,
        cli.token,
        config.request_timeout(),
        config.connect_timeout(),
    )?);

    match cli.command {
        Command::Watch {
            workspace,
            task,
            json,
            no_logs,
        } => watch(api, &config, workspace, task, json, !no_logs).await,
        Command::Logs {
            task,
            log_type,
            stage,
        } => logs(&api, task, log_type, stage.as_deref()).await,
    }
}

async fn watch(
    api: Arc<ApiClient>,
    config: &Config,
    workspace_id: String,
    task_id: u64,
    json: bool,
    print_logs: bool,
) -> Result<()> {
    let connector = Arc::new(WsConnector::new(config.connect_timeout()));
    let registry = StreamRegistry::new();
    let stream_options = StreamOptions {
        task_id,
        url: api.stream_url(task_id)?,
        token: api.token().map(str::to_string),
        variant: StreamVariant::Apply,
        policy: config.reconnect.policy(),
        max_buffered_events: config.max_buffered_events,
    };
    let stream = registry.acquire(task_id, || StreamClient::new(stream_options, connector));

    let monitor = RunMonitor::spawn(
        api,
        stream,
        MonitorOptions {
            workspace_id,
            task_id,
            poll: PollOptions {
                interval: config.poll_interval(),
                request_timeout: config.request_timeout(),
            },
            stall_after: config.stall_after(),
            completion_grace: config.poll_interval(),
        },
    );

    let mut views = WatchStream::new(monitor.subscribe());
    let mut printer = Printer::default();
    let outcome = loop {
        tokio::select! {
            view = views.next() => {
                let Some(view) = view else { break None };
                if json {
                    println!("{}", serde_json::to_string(&view)?);
                } else {
                    printer.print(&view, print_logs);
                }
                if view.finished {
                    break Some(view);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "runlens::startup", "Interrupted");
                break None;
            }
        }
    };

    monitor.stop().await;
    registry.shutdown().await;

    match outcome.and_then(|view| view.timeline.status) {
        Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
            bail!("task {task_id} ended with status {status}")
        }
        _ => Ok(()),
    }
}

/// Text rendering of monitor views. Prints a status line when it changes
/// and any log lines not printed yet.
#[derive(Default)]
struct Printer {
    last_summary: String,
    printed_lines: Vec<usize>,
}

impl Printer {
    fn print(&mut self, view: &MonitorView, print_logs: bool) {
        if print_logs {
            self.print_new_lines(&view.stages);
        }
        let summary = summarize(view);
        if summary != self.last_summary {
            println!("{summary}");
            self.last_summary = summary;
        }
    }

    fn print_new_lines(&mut self, stages: &[StageLog]) {
        self.printed_lines.resize(stages.len(), 0);
        for (stage, printed) in stages.iter().zip(self.printed_lines.iter_mut()) {
            let lines: Vec<&str> = stage.logs.split('\n').collect();
            for line in lines.iter().skip(*printed) {
                println!("  {line}");
            }
            *printed = lines.len();
        }
    }
}

fn summarize(view: &MonitorView) -> String {
    let timeline = &view.timeline;
    let mut parts = vec![format!(
        "{} {}",
        timeline.planning.icon.glyph(),
        timeline.planning.label
    )];
    if let Some(applying) = &timeline.applying {
        parts.push(format!("{} {}", applying.icon.glyph(), applying.label));
    }
    if let Some(stage) = &timeline.current_stage {
        parts.push(format!("stage: {}", stage.display_name));
    }
    let counts = timeline.resource_counts;
    if counts.total() > 0 {
        parts.push(format!(
            "resources: {}/{} done, {} failed",
            counts.completed,
            counts.total(),
            counts.failed
        ));
    }
    parts.push(match view.connection.status {
        ConnectionStatus::Connected => "stream: live".to_string(),
        ConnectionStatus::Connecting if view.connection.reconnect_attempt > 0 => {
            format!("stream: reconnecting ({})", view.connection.reconnect_attempt)
        }
        ConnectionStatus::Connecting => "stream: connecting".to_string(),
        ConnectionStatus::Disconnected => "stream: offline".to_string(),
    });
    if timeline.stalled {
        parts.push("STALLED".to_string());
    }
    if let Some(error) = &view.stream_error {
        parts.push(format!("stream error: {error}"));
    }
    if let Some(error) = &view.poll_error {
        parts.push(format!("poll error: {error}"));
    }
    parts.join(" | ")
}

async fn logs(api: &ApiClient, task_id: u64, log_type: LogType, only: Option<&str>) -> Result<()> {
    let text = api
        .get_logs(task_id, log_type)
        .await
        .with_context(|| format!("fetching logs for task {task_id}"))?;

    let only = only.map(|s| s.trim().to_lowercase());
    let stages: Vec<StageLog> = partition_text(&text)
        .into_iter()
        .filter(|stage| only.as_deref().is_none_or(|name| stage.name == name))
        .collect();

    if stages.is_empty() {
        if let Some(name) = only {
            bail!("no stage named {name} in task {task_id}");
        }
        println!("{text}");
        return Ok(());
    }

    for stage in stages {
        let started = stage.start_time.as_deref().unwrap_or("?");
        let ended = stage.end_time.as_deref().unwrap_or("running");
        println!("── {} ({} → {}) ──", stage.display_name, started, ended);
        println!("{}", stage.logs);
    }
    Ok(())
}
