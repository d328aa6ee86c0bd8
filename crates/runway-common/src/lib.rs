//! Shared domain types for the runway orchestrator.
//!
//! `models` holds the persisted records (runs, steps, approval requests) and
//! `events` holds the live event schema streamed to observers. Both are plain
//! serde types so the server, the CLI and external clients agree on one wire
//! format.

pub mod events;
pub mod models;

pub use events::{RunStream, RunStreamEvent};
pub use models::*;
