//! Core engine for the labelmarket coordinator.
//!
//! This crate owns the task lifecycle: the durable queue, lease-based
//! assignment, worker liveness, submission dedup and quorum finalization, and
//! the reaper that reclaims abandoned work. Everything coordinates through
//! the store's transactions; there is no in-process shared mutable state.
//!
//! # API notes
//! `market-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`chrono::DateTime<Utc>`, `sqlx::SqlitePool`)
//! as part of the coordinator contract.

pub mod aggregate;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod reaper;
pub mod store;
pub mod tasks;
pub mod workers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use store::Store;
