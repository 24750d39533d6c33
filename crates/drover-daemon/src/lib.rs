//! drover Daemon Library
//!
//! Core functionality for the drover orchestrator:
//! - Task queue adapters (beads CLI, in-memory)
//! - Worker agent runner, concurrency gate and scheduler loop
//! - Notification emitter over a `SQLite` sink
//! - Usage-threshold monitor

pub mod notify;
pub mod orchestration;
pub mod queue;
pub mod storage;
pub mod usage;
