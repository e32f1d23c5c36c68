//! Logging setup for the `runlens` binary.
//!
//! Every event is emitted under one of the [`targets`] below. Presets map
//! each target to a level; `--log target=level` adjusts single targets and
//! `RUST_LOG` replaces the whole filter. Logs always go to stderr because
//! `runlens watch --json` owns stdout.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log targets used across the crate.
pub mod targets {
    pub const STARTUP: &str = "runlens::startup";
    pub const API: &str = "runlens::api";
    pub const POLL: &str = "runlens::poll";
    pub const STREAM: &str = "runlens::stream";
    /// One event per received frame. Off unless asked for.
    pub const FRAMES: &str = "runlens::stream::frames";
    pub const STAGE: &str = "runlens::stage";
    pub const RECONCILE: &str = "runlens::reconcile";

    pub const ALL: &[&str] = &[STARTUP, API, POLL, STREAM, FRAMES, STAGE, RECONCILE];
}

/// Transport crates that get their own levels.
const EXTERNAL_TARGETS: &[&str] = &["reqwest", "hyper", "tungstenite", "tokio_tungstenite"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: '{}'. Use 'text' or 'json'.", s)),
        }
    }
}

/// Logging preset levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPreset {
    /// Connection drops, reconnects and stage changes
    #[default]
    Production,
    /// Adds every poll and every resource-list refresh
    Verbose,
    /// Everything except per-frame traces
    Debug,
    /// Every stream frame as received
    Trace,
    /// Warnings and errors only
    Quiet,
}

impl LogPreset {
    /// Level for one of our targets under this preset.
    fn level_for(self, target: &str) -> LevelFilter {
        use targets::*;
        match self {
            LogPreset::Quiet => LevelFilter::WARN,
            LogPreset::Trace => LevelFilter::TRACE,
            LogPreset::Debug if target == FRAMES => LevelFilter::OFF,
            LogPreset::Debug => LevelFilter::DEBUG,
            LogPreset::Verbose if target == FRAMES => LevelFilter::OFF,
            LogPreset::Verbose => LevelFilter::INFO,
            LogPreset::Production => match target {
                FRAMES => LevelFilter::OFF,
                STARTUP | STREAM | STAGE => LevelFilter::INFO,
                _ => LevelFilter::WARN,
            },
        }
    }

    fn external_level(self) -> LevelFilter {
        match self {
            LogPreset::Quiet => LevelFilter::ERROR,
            LogPreset::Production | LogPreset::Verbose => LevelFilter::WARN,
            LogPreset::Debug => LevelFilter::DEBUG,
            LogPreset::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging configuration built from CLI arguments.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub preset: LogPreset,
    /// Per-target level overrides (e.g., "runlens::stream" -> DEBUG)
    pub overrides: BTreeMap<String, LevelFilter>,
    /// `--log` entries that named an unknown target or level.
    pub rejected: Vec<String>,
    pub format: LogFormat,
}

impl LogConfig {
    /// Create a new LogConfig from CLI arguments.
    pub fn from_cli(
        verbose: bool,
        debug: bool,
        trace: bool,
        quiet: bool,
        log_overrides: Vec<String>,
        format: LogFormat,
    ) -> Self {
        let preset = if quiet {
            LogPreset::Quiet
        } else if trace {
            LogPreset::Trace
        } else if debug {
            LogPreset::Debug
        } else if verbose {
            LogPreset::Verbose
        } else {
            LogPreset::Production
        };

        // Format: "target=level", comma separated or repeated
        let mut overrides = BTreeMap::new();
        let mut rejected = Vec::new();
        for part in log_overrides.iter().flat_map(|s| s.split(',')) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match parse_override(part) {
                Some((target, level)) => {
                    overrides.insert(target, level);
                }
                None => rejected.push(part.to_string()),
            }
        }

        Self {
            preset,
            overrides,
            rejected,
            format,
        }
    }

    /// Filter directives for the preset plus overrides, in target order.
    pub fn directives(&self) -> Vec<String> {
        let mut levels: BTreeMap<String, LevelFilter> = targets::ALL
            .iter()
            .map(|target| (target.to_string(), self.preset.level_for(target)))
            .collect();
        for target in EXTERNAL_TARGETS {
            levels.insert(target.to_string(), self.preset.external_level());
        }
        levels.extend(self.overrides.iter().map(|(t, l)| (t.clone(), *l)));

        levels
            .into_iter()
            .map(|(target, level)| format!("{target}={}", level.to_string().to_lowercase()))
            .collect()
    }

    /// Build an EnvFilter from this configuration. `RUST_LOG` wins when set.
    pub fn build_filter(&self) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }
        let filter = self.directives().join(",");
        EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("runlens=info"))
    }
}

/// Parse `target=level`. Short targets get the `runlens::` prefix; only
/// known targets (or their parents) are accepted.
fn parse_override(part: &str) -> Option<(String, LevelFilter)> {
    let (target, level) = part.split_once('=')?;
    let target = target.trim();
    let level: LevelFilter = level.trim().parse().ok()?;

    if EXTERNAL_TARGETS.contains(&target) || target == "runlens" {
        return Some((target.to_string(), level));
    }
    let full = if target.starts_with("runlens::") {
        target.to_string()
    } else {
        format!("runlens::{target}")
    };
    let known = targets::ALL
        .iter()
        .any(|known| *known == full || known.starts_with(&format!("{full}::")));
    known.then_some((full, level))
}

/// Install the global subscriber. Rejected `--log` entries are reported
/// once the subscriber is up.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = config.build_filter();

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
    };
    installed.map_err(|e| anyhow!("installing log subscriber: {e}"))?;

    for entry in &config.rejected {
        tracing::warn!(
            target: targets::STARTUP,
            entry = %entry,
            known = ?targets::ALL,
            "Ignoring --log entry with unknown target or level"
        );
    }
    Ok(())
}
