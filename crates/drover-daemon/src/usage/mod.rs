//! Usage-threshold monitoring.
//!
//! A reporter samples usage percentages per bucket; the monitor compares
//! them against configured thresholds and raises one alert per crossing,
//! remembering the highest alerted threshold in the watermark table.

pub mod monitor;
pub mod reporter;
pub mod reset_time;

pub use monitor::{UsageAlert, UsageMonitor, UsageMonitorConfig};
pub use reporter::{ScriptReporter, UsageReporter, UsageSample};
pub use reset_time::format_reset_time;

use crate::storage::DatabaseError;

/// Errors from a usage check.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("usage script failed: {0}")]
    Script(String),

    #[error("failed to parse usage output: {0}")]
    Parse(String),

    #[error("usage script timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
