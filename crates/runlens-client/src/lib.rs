//! Runlens client library - REST polling, live streaming and the run monitor
//! that reconciles both into one view of a plan/apply task.
//!
//! Separated from main.rs so integration tests can drive it against
//! in-process servers.

pub mod api;
pub mod config;
mod error;
pub mod logging;
pub mod monitor;
pub mod poller;
pub mod registry;
pub mod stream;

pub use api::{ApiClient, LogType, RunApi};
pub use error::ClientError;
pub use monitor::{MonitorOptions, MonitorView, RunMonitor};
pub use poller::{PollOptions, PollState, TaskPoller};
pub use registry::StreamRegistry;
pub use stream::{
    Connection, Connector, EventCursor, Frame, StreamClient, StreamOptions, StreamState,
    StreamVariant, WsConnector,
};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
