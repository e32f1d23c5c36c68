//! Run monitor: the single owner of a task's reconciled state.
//!
//! Two producers feed one actor. The poller supplies task snapshots and the
//! stream supplies markers, output and resource updates. Only the actor
//! touches the stage tracker, the reconciler and the log partitioner;
//! consumers get immutable [`MonitorView`] snapshots over a watch channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use runlens_core::{
    LogPartitioner, ResourceReconciler, StageLog, StageTracker, TimelineView,
};
use runlens_types::{ConnectionState, StreamMessage, TaskSnapshot, TaskStatus};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::RunApi;
use crate::poller::{PollOptions, PollState, TaskPoller};
use crate::stream::{Connector, EventCursor, StreamClient, StreamState};

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub workspace_id: String,
    pub task_id: u64,
    pub poll: PollOptions,
    /// How long snapshot and live stage may disagree before the run is
    /// reported as stalled.
    pub stall_after: Duration,
    /// How long to wait for the stream's `completed` event once the
    /// snapshot is terminal.
    pub completion_grace: Duration,
}

/// Everything a consumer sees about one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorView {
    pub timeline: TimelineView,
    pub connection: ConnectionState,
    pub stream_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_error: Option<String>,
    /// Live log split by stage.
    pub stages: Vec<StageLog>,
    /// The task is terminal and both producers have stopped.
    pub finished: bool,
}

impl MonitorView {
    fn empty() -> Self {
        Self {
            timeline: TimelineView::build(&StageTracker::new(), &ResourceReconciler::new(), false),
            connection: ConnectionState::default(),
            stream_completed: false,
            stream_error: None,
            poll_error: None,
            stages: Vec::new(),
            finished: false,
        }
    }
}

/// Handle to a running monitor.
pub struct RunMonitor<C: Connector> {
    view_rx: watch::Receiver<MonitorView>,
    poller: Arc<TaskPoller>,
    stream: StreamClient<C>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> RunMonitor<C> {
    /// Start polling and streaming for the task.
    pub fn spawn<A: RunApi>(api: Arc<A>, stream: StreamClient<C>, options: MonitorOptions) -> Self {
        let poller = Arc::new(TaskPoller::spawn(
            Arc::clone(&api),
            options.workspace_id.clone(),
            options.task_id,
            options.poll,
        ));
        stream.start();

        let (view_tx, view_rx) = watch::channel(MonitorView::empty());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let actor = Actor {
            api,
            options,
            poll_rx: poller.subscribe(),
            stream_rx: stream.subscribe_state(),
            cursor: stream.cursor(),
            stream: stream.clone(),
            view_tx,
            tracker: StageTracker::new(),
            reconciler: ResourceReconciler::new(),
            partitioner: LogPartitioner::new(),
            poll_state: PollState::default(),
            stream_state: StreamState::default(),
            last_status: None,
            terminal_deadline: None,
        };
        let handle = tokio::spawn(actor.run(shutdown_rx));

        Self {
            view_rx,
            poller,
            stream,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn view(&self) -> MonitorView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view_rx.clone()
    }

    /// Fetch the task now and restart the stream if it gave up.
    pub fn refresh(&self) {
        self.poller.refresh();
        let view = self.view_rx.borrow();
        if view.stream_error.is_some() && !view.timeline.is_terminal() {
            info!(target: "runlens::stream", task_id = self.stream.task_id(), "Restarting stream");
            self.stream.start();
        }
    }

    /// Wait until the task is terminal and both producers have stopped.
    pub async fn finished(&self) -> MonitorView {
        let mut rx = self.view_rx.clone();
        match rx.wait_for(|view| view.finished).await {
            Ok(view) => view.clone(),
            Err(_) => self.view(),
        }
    }

    /// Tear everything down.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.poller.stop().await;
        self.stream.stop().await;
    }
}

struct Actor<A: RunApi, C: Connector> {
    api: Arc<A>,
    options: MonitorOptions,
    poll_rx: watch::Receiver<PollState>,
    stream_rx: watch::Receiver<StreamState>,
    cursor: EventCursor,
    stream: StreamClient<C>,
    view_tx: watch::Sender<MonitorView>,
    tracker: StageTracker,
    reconciler: ResourceReconciler,
    partitioner: LogPartitioner,
    poll_state: PollState,
    stream_state: StreamState,
    last_status: Option<TaskStatus>,
    terminal_deadline: Option<Instant>,
}

impl<A: RunApi, C: Connector> Actor<A, C> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let task_id = self.options.task_id;
        let check_every = (self.options.stall_after / 4).max(Duration::from_millis(250));
        let mut stall_tick = tokio::time::interval(check_every);
        stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poller_done = false;

        loop {
            let deadline = self.terminal_deadline;
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = self.poll_rx.changed(), if !poller_done => {
                    if changed.is_err() {
                        // Poller exited; its final state was already seen.
                        poller_done = true;
                        continue;
                    }
                    let state = self.poll_rx.borrow_and_update().clone();
                    self.on_poll(state).await;
                }
                events = self.cursor.next_batch() => {
                    for event in events {
                        self.on_message(event.message);
                    }
                }
                _ = self.stream_rx.changed() => {
                    self.stream_state = self.stream_rx.borrow_and_update().clone();
                }
                _ = sleep_until_opt(deadline) => {
                    debug!(target: "runlens::stream", task_id, "No completion event, closing stream");
                    self.terminal_deadline = None;
                    self.stream.set_task_active(false);
                }
                _ = stall_tick.tick() => {}
            }

            let finished = self.is_finished();
            if finished {
                // Pick up anything the stream appended before it stopped.
                for event in self.cursor.try_next_batch().await {
                    self.on_message(event.message);
                }
            }
            self.publish(finished);
            if finished {
                info!(target: "runlens::stage", task_id, "Run finished");
                break;
            }
        }
    }

    async fn on_poll(&mut self, state: PollState) {
        if let Some(snapshot) = &state.snapshot {
            if self.last_status != Some(snapshot.status) {
                self.on_status_change(snapshot).await;
            }
            self.reconciler.set_id_fallback(!snapshot.is_agent_mode());
            self.tracker.apply_snapshot(snapshot.clone());
        }
        self.poll_state = state;
    }

    async fn on_status_change(&mut self, snapshot: &TaskSnapshot) {
        info!(
            target: "runlens::stage",
            task_id = snapshot.id,
            from = self.last_status.map(TaskStatus::as_str).unwrap_or("-"),
            to = %snapshot.status,
            "Status"
        );
        self.last_status = Some(snapshot.status);

        if snapshot.status != TaskStatus::Pending {
            self.refetch_resources().await;
        }

        if snapshot.is_terminal() {
            if self.stream_state.completed || !self.stream.is_running() {
                self.stream.set_task_active(false);
            } else {
                self.terminal_deadline = Some(Instant::now() + self.options.completion_grace);
            }
        }
    }

    async fn refetch_resources(&mut self) {
        let fetch = self
            .api
            .fetch_resource_changes(&self.options.workspace_id, self.options.task_id);
        match tokio::time::timeout(self.options.poll.request_timeout, fetch).await {
            Ok(Ok(response)) => {
                debug!(
                    target: "runlens::reconcile",
                    task_id = self.options.task_id,
                    count = response.resources.len(),
                    "Loaded resource changes"
                );
                self.reconciler.replace_all(response.resources);
            }
            Ok(Err(e)) => {
                debug!(target: "runlens::reconcile", error = %e, "Resource changes unavailable");
            }
            Err(_) => {
                debug!(target: "runlens::reconcile", "Resource changes fetch timed out");
            }
        }
    }

    fn on_message(&mut self, message: StreamMessage) {
        match &message {
            StreamMessage::StageMarker(marker) => {
                self.partitioner.push_marker(marker);
                self.tracker.apply_marker(marker.clone());
            }
            StreamMessage::Output(_) | StreamMessage::Error(_) => {
                self.partitioner.push_message(&message);
            }
            StreamMessage::ResourceStatusUpdate(_) | StreamMessage::ResourceIdUpdate(_) => {
                if let Err(e) = self.reconciler.apply_message(&message) {
                    warn!(target: "runlens::reconcile", error = %e, "Dropping resource update");
                }
            }
            StreamMessage::Completed { .. } => {
                self.terminal_deadline = None;
            }
            StreamMessage::Connected { .. } | StreamMessage::Unknown => {}
        }
    }

    fn is_finished(&self) -> bool {
        let terminal = self
            .poll_state
            .snapshot
            .as_ref()
            .is_some_and(TaskSnapshot::is_terminal);
        terminal && !self.poll_state.polling && !self.stream.is_running()
    }

    fn publish(&mut self, finished: bool) {
        let stalled = self
            .tracker
            .check_stall(Instant::now().into_std(), self.options.stall_after);
        let view = MonitorView {
            timeline: TimelineView::build(&self.tracker, &self.reconciler, stalled),
            connection: self.stream_state.connection.clone(),
            stream_completed: self.stream_state.completed,
            stream_error: self.stream_state.error.clone(),
            poll_error: self.poll_state.error.clone(),
            stages: self.partitioner.snapshot(),
            finished,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
