//! drover Core Library
//!
//! Shared functionality for the drover orchestrator:
//! - NDJSON parsing for the worker agent's stream-json event protocol
//! - Layered configuration resolution
//! - `SQLite` pool helpers
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
