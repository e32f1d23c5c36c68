//! Shared types for the Runlens run-observability engine.

mod resource;
mod stream;
mod task;

pub use resource::*;
pub use stream::*;
pub use task::*;
