pub mod approvals;
pub mod config;
pub mod errors;
pub mod events;
pub mod integrations;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod steps;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
