//! Coordinator service for the labelmarket task market.
//!
//! Wires the `market-core` engine into a deployable process: configuration,
//! the axum HTTP surface, the background reaper loop, and a typed client for
//! workers and producers.

pub mod client;
pub mod config;
pub mod server;
