//! `SQLite` storage for the drover daemon.
//!
//! Provides persistence for notifications and usage alert watermarks.

mod db;
mod models;
mod queries;
mod queries_usage;

pub use db::{Database, DatabaseError};
pub use models::*;
