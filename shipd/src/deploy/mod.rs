//! Deployment module

pub mod events;
pub mod live;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod sink;
pub mod store;
