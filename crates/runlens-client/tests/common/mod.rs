//! Shared fakes for client integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use runlens_client::{
    ClientError, Connection, Connector, Frame, Result, RunApi, StreamClient, StreamOptions,
    StreamVariant,
};
use runlens_core::ReconnectPolicy;
use runlens_types::{ResourceChangesResponse, TaskSnapshot};
use serde_json::{json, Value};
use tokio::time::Instant;
use url::Url;

// ============================================================================
// Scripted stream transport
// ============================================================================

/// What one connect attempt does.
#[derive(Debug, Clone)]
pub enum Script {
    /// The connect call itself fails.
    Refuse(String),
    /// Connects, delivers the frames, then the transport ends.
    Frames(Vec<Frame>),
    /// Connects, delivers the frames, then stays open.
    FramesThenHold(Vec<Frame>),
}

#[derive(Default)]
struct ConnectorState {
    scripts: VecDeque<Script>,
    connects: Vec<Instant>,
    tokens: Vec<Option<String>>,
}

/// Connector that plays back scripts in order. Once they run out every
/// attempt is refused.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let connector = Self::default();
        connector.state.lock().unwrap().scripts = scripts.into_iter().collect();
        connector
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects.len()
    }

    /// Time between consecutive connect attempts, in whole seconds.
    pub fn gaps_secs(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .connects
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().tokens.clone()
    }
}

pub struct ScriptedConnection {
    frames: VecDeque<Frame>,
    hold: bool,
}

impl Connector for ScriptedConnector {
    type Conn = ScriptedConnection;

    async fn connect(&self, _url: &Url, token: Option<&str>) -> Result<ScriptedConnection> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.connects.push(Instant::now());
            state.tokens.push(token.map(str::to_string));
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| Script::Refuse("connection refused".to_string()))
        };
        match script {
            Script::Refuse(reason) => Err(ClientError::Closed(reason)),
            Script::Frames(frames) => Ok(ScriptedConnection {
                frames: frames.into(),
                hold: false,
            }),
            Script::FramesThenHold(frames) => Ok(ScriptedConnection {
                frames: frames.into(),
                hold: true,
            }),
        }
    }
}

impl Connection for ScriptedConnection {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(Ok(frame));
        }
        if self.hold {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn close(&mut self) {
        self.frames.clear();
        self.hold = false;
    }
}

// ============================================================================
// Frames
// ============================================================================

pub fn text(value: Value) -> Frame {
    Frame::Text(value.to_string())
}

pub fn connected() -> Frame {
    text(json!({"type": "connected", "task_id": 42, "client_id": "c-1"}))
}

pub fn output(line: &str, line_num: u64) -> Frame {
    text(json!({"type": "output", "line": line, "line_num": line_num}))
}

pub fn marker(stage: &str, status: &str, line_num: u64) -> Frame {
    let verb = status.to_uppercase();
    let name = stage.to_uppercase();
    text(json!({
        "type": "stage_marker",
        "stage": stage,
        "status": status,
        "timestamp": "2025-01-01T10:00:00Z",
        "line": format!("========== {name} {verb} at 2025-01-01 10:00:00.000 =========="),
        "line_num": line_num,
    }))
}

pub fn completed() -> Frame {
    text(json!({"type": "completed", "timestamp": "2025-01-01T10:05:00Z"}))
}

pub fn resource_status(address: &str, status: &str) -> Frame {
    let payload = json!({"resource_address": address, "apply_status": status});
    text(json!({"type": "resource_status_update", "line": payload.to_string()}))
}

// ============================================================================
// Clients
// ============================================================================

pub fn stream_options(variant: StreamVariant) -> StreamOptions {
    StreamOptions {
        task_id: 42,
        url: Url::parse("ws://localhost:1/tasks/42/output/stream").unwrap(),
        token: Some("secret".to_string()),
        variant,
        policy: ReconnectPolicy::default(),
        max_buffered_events: 1000,
    }
}

pub fn scripted_client(
    connector: &ScriptedConnector,
    variant: StreamVariant,
) -> StreamClient<ScriptedConnector> {
    StreamClient::new(stream_options(variant), Arc::new(connector.clone()))
}

// ============================================================================
// Fake task service
// ============================================================================

/// Returns queued snapshots one per fetch, repeating the last one.
#[derive(Default)]
pub struct FakeApi {
    snapshots: Mutex<VecDeque<TaskSnapshot>>,
    last: Mutex<Option<TaskSnapshot>>,
    resources: Mutex<ResourceChangesResponse>,
    failing: Mutex<bool>,
    task_fetches: Mutex<u32>,
    resource_fetches: Mutex<u32>,
}

impl FakeApi {
    pub fn new(snapshots: impl IntoIterator<Item = TaskSnapshot>) -> Self {
        let api = Self::default();
        *api.snapshots.lock().unwrap() = snapshots.into_iter().collect();
        api
    }

    pub fn with_resources(self, resources: ResourceChangesResponse) -> Self {
        *self.resources.lock().unwrap() = resources;
        self
    }

    /// Make every task fetch fail with a 503 until reset.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn task_fetches(&self) -> u32 {
        *self.task_fetches.lock().unwrap()
    }

    pub fn resource_fetches(&self) -> u32 {
        *self.resource_fetches.lock().unwrap()
    }
}

impl RunApi for FakeApi {
    async fn fetch_task(&self, _workspace_id: &str, _task_id: u64) -> Result<TaskSnapshot> {
        *self.task_fetches.lock().unwrap() += 1;
        if *self.failing.lock().unwrap() {
            return Err(ClientError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let next = self.snapshots.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(snapshot) = next {
            *last = Some(snapshot);
        }
        last.clone().ok_or_else(|| ClientError::Status {
            status: 404,
            body: "task not found".to_string(),
        })
    }

    async fn fetch_resource_changes(
        &self,
        _workspace_id: &str,
        _task_id: u64,
    ) -> Result<ResourceChangesResponse> {
        *self.resource_fetches.lock().unwrap() += 1;
        Ok(self.resources.lock().unwrap().clone())
    }
}
