//! Splits task logs into per-stage buffers using BEGIN/END markers.
//!
//! The executor brackets every stage with lines of the form
//! `========== INIT BEGIN at 2025-01-02 10:00:00.000 ==========` and the
//! matching `END` line. Marker lines are kept inside their stage's buffer.
//! Lines outside any open stage (preamble, gaps between stages) are dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use runlens_types::{MarkerStatus, StageMarker, StreamMessage};
use serde::Serialize;

use crate::catalog;

static BEGIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^========== (\w+) BEGIN at (.+) ==========$").unwrap());
static END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^========== (\w+) END at (.+) ==========$").unwrap());
static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^=== \w+ OUTPUT ===$").unwrap());

/// Timestamp layout the executor uses inside marker lines.
const MARKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Logs belonging to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageLog {
    pub name: String,
    pub display_name: String,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl StageLog {
    /// True while no END marker has been seen.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug)]
struct OpenStage {
    name: String,
    start_time: Option<String>,
    lines: Vec<String>,
}

impl OpenStage {
    fn close(self, end_time: Option<String>) -> StageLog {
        StageLog {
            display_name: catalog::display_name(&self.name),
            name: self.name,
            logs: self.lines.join("\n"),
            start_time: self.start_time,
            end_time,
        }
    }
}

/// Incremental partitioner. Feed lines or stream events in order, then
/// call [`LogPartitioner::finish`].
#[derive(Debug, Default)]
pub struct LogPartitioner {
    stages: Vec<StageLog>,
    open: Option<OpenStage>,
}

impl LogPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw log line.
    pub fn push_line(&mut self, line: &str) {
        if let Some(caps) = BEGIN_RE.captures(line) {
            self.begin(caps[1].to_lowercase(), Some(caps[2].to_string()), line.to_string());
            return;
        }

        if let Some(caps) = END_RE.captures(line) {
            self.end(Some(caps[2].to_string()), line.to_string());
            return;
        }

        if let Some(open) = self.open.as_mut() {
            open.lines.push(line.to_string());
        }
    }

    /// Feed one live stream message. Only output, error and stage markers
    /// carry log content; everything else is ignored.
    pub fn push_message(&mut self, message: &StreamMessage) {
        match message {
            StreamMessage::Output(line) | StreamMessage::Error(line) => {
                if let Some(open) = self.open.as_mut() {
                    open.lines.push(line.line.clone());
                }
            }
            StreamMessage::StageMarker(marker) => self.push_marker(marker),
            _ => {}
        }
    }

    /// Feed one structured stage marker.
    pub fn push_marker(&mut self, marker: &StageMarker) {
        let time = marker
            .timestamp
            .map(|ts| ts.format(MARKER_TIME_FORMAT).to_string());
        let line = if marker.line.is_empty() {
            render_marker(marker, time.as_deref())
        } else {
            marker.line.clone()
        };
        match marker.status {
            MarkerStatus::Begin => self.begin(marker.stage_name(), time, line),
            MarkerStatus::End => self.end(time, line),
        }
    }

    fn begin(&mut self, name: String, start_time: Option<String>, line: String) {
        // A BEGIN inside an open stage is an implicit boundary.
        if let Some(open) = self.open.take() {
            self.stages.push(open.close(None));
        }
        self.open = Some(OpenStage {
            name,
            start_time,
            lines: vec![line],
        });
    }

    fn end(&mut self, end_time: Option<String>, line: String) {
        // END without an open stage is preamble noise.
        if let Some(mut open) = self.open.take() {
            open.lines.push(line);
            self.stages.push(open.close(end_time));
        }
    }

    /// Completed stages so far plus the open one, without consuming.
    pub fn snapshot(&self) -> Vec<StageLog> {
        let mut out = self.stages.clone();
        if let Some(open) = &self.open {
            out.push(StageLog {
                name: open.name.clone(),
                display_name: catalog::display_name(&open.name),
                logs: open.lines.join("\n"),
                start_time: open.start_time.clone(),
                end_time: None,
            });
        }
        out
    }

    /// Emit all stages. A still-open stage is emitted without an end time.
    pub fn finish(mut self) -> Vec<StageLog> {
        if let Some(open) = self.open.take() {
            self.stages.push(open.close(None));
        }
        self.stages
    }
}

fn render_marker(marker: &StageMarker, time: Option<&str>) -> String {
    let verb = match marker.status {
        MarkerStatus::Begin => "BEGIN",
        MarkerStatus::End => "END",
    };
    format!(
        "========== {} {} at {} ==========",
        marker.stage.trim().to_uppercase(),
        verb,
        time.unwrap_or("-")
    )
}

/// Partition a flat log text, discarding a leading `=== X OUTPUT ===` header.
pub fn partition_text(text: &str) -> Vec<StageLog> {
    let mut partitioner = LogPartitioner::new();
    let mut lines = text.split('\n').peekable();
    if lines.peek().is_some_and(|first| HEADER_RE.is_match(first.trim_end())) {
        lines.next();
    }
    for line in lines {
        partitioner.push_line(line);
    }
    partitioner.finish()
}

/// Concatenate stage logs in order.
pub fn join_stages(stages: &[StageLog]) -> String {
    stages
        .iter()
        .map(|s| s.logs.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
