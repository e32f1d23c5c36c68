//! One live stream client per task id.

use dashmap::DashMap;
use tracing::debug;

use crate::stream::{Connector, StreamClient, WsConnector};

/// Hands out the existing client for a task instead of opening a second
/// socket.
pub struct StreamRegistry<C: Connector = WsConnector> {
    clients: DashMap<u64, StreamClient<C>>,
}

impl<C: Connector> Default for StreamRegistry<C> {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}

impl<C: Connector> StreamRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing client for `task_id`, or one built by `make`. The client is
    /// started either way; starting a running client is a no-op.
    pub fn acquire(&self, task_id: u64, make: impl FnOnce() -> StreamClient<C>) -> StreamClient<C> {
        let client = self
            .clients
            .entry(task_id)
            .or_insert_with(|| {
                debug!(target: "runlens::stream", task_id, "Registering stream client");
                make()
            })
            .clone();
        client.start();
        client
    }

    pub fn get(&self, task_id: u64) -> Option<StreamClient<C>> {
        self.clients.get(&task_id).map(|entry| entry.clone())
    }

    /// Remove and stop the client for `task_id`.
    pub async fn release(&self, task_id: u64) {
        if let Some((_, client)) = self.clients.remove(&task_id) {
            client.dispose().await;
        }
    }

    /// Stop every client.
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = self.clients.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.release(id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
