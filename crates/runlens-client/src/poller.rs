//! Periodic task snapshot polling.
//!
//! Fetches once immediately, then on a fixed interval until the task reaches
//! a terminal status. A failed fetch keeps the last good snapshot and the
//! loop keeps going.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use runlens_types::TaskSnapshot;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::RunApi;
use crate::ClientError;

/// Shortest interval the loop will tick at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    /// Per-fetch timeout.
    pub request_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// What the poller has observed so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollState {
    /// Last successfully fetched snapshot.
    pub snapshot: Option<TaskSnapshot>,
    /// Error from the most recent fetch, cleared on success.
    pub error: Option<String>,
    pub consecutive_failures: u32,
    /// False once polling has stopped.
    pub polling: bool,
}

pub struct TaskPoller {
    state_rx: watch::Receiver<PollState>,
    refresh: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPoller {
    /// Start polling `task_id` in `workspace_id`.
    pub fn spawn<A: RunApi>(
        api: Arc<A>,
        workspace_id: impl Into<String>,
        task_id: u64,
        options: PollOptions,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PollState {
            polling: true,
            ..PollState::default()
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let refresh = Arc::new(Notify::new());

        let handle = tokio::spawn(poll_loop(
            api,
            workspace_id.into(),
            task_id,
            options,
            state_tx,
            Arc::clone(&refresh),
            shutdown_rx,
        ));

        Self {
            state_rx,
            refresh,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> PollState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_rx.clone()
    }

    /// Fetch now instead of waiting for the next tick.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Cancel the interval and wait for the loop to exit.
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
    }
}

impl Drop for TaskPoller {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn poll_loop<A: RunApi>(
    api: Arc<A>,
    workspace_id: String,
    task_id: u64,
    options: PollOptions,
    state_tx: watch::Sender<PollState>,
    refresh: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(options.interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = refresh.notified() => {
                debug!(target: "runlens::poll", task_id, "Manual refresh");
                ticker.reset();
            }
        }

        let fetched = tokio::time::timeout(
            options.request_timeout,
            api.fetch_task(&workspace_id, task_id),
        )
        .await
        .unwrap_or_else(|_| Err(ClientError::Timeout(options.request_timeout.as_millis() as u64)));

        match fetched {
            Ok(snapshot) => {
                let terminal = snapshot.is_terminal();
                debug!(
                    target: "runlens::poll",
                    task_id,
                    status = %snapshot.status,
                    stage = snapshot.stage.as_deref().unwrap_or("-"),
                    "Fetched task"
                );
                state_tx.send_modify(|state| {
                    state.snapshot = Some(snapshot);
                    state.error = None;
                    state.consecutive_failures = 0;
                });
                if terminal {
                    info!(target: "runlens::poll", task_id, "Task reached terminal status, polling stopped");
                    break;
                }
            }
            Err(e) => {
                warn!(target: "runlens::poll", task_id, error = %e, "Task fetch failed");
                state_tx.send_modify(|state| {
                    state.error = Some(e.to_string());
                    state.consecutive_failures += 1;
                });
            }
        }
    }

    state_tx.send_modify(|state| state.polling = false);
}
