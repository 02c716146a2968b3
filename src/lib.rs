//! genlane — multi-lane background task lifecycle engine.
//!
//! Keeps three stores consistent: the lane queues, the relational task
//! ledger, and the billing ledger under worker crashes and broker hiccups,
//! and reconstructs a deterministic run view from a replayable event log.

pub mod api;
pub mod billing;
pub mod config;
pub mod error;
pub mod events;
pub mod poller;
pub mod queue;
pub mod runstream;
pub mod store;
pub mod task;
pub mod watchdog;
