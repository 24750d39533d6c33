//! File-based cancel requests.
//!
//! Other local processes ask for a run to stop by adding its task ID to a
//! JSON array in `cancel_tasks.json`. Handled IDs are removed again.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// The cancel request file.
#[derive(Debug, Clone)]
pub struct CancelRequests {
    path: PathBuf,
}

impl CancelRequests {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Task IDs currently requested for cancellation.
    ///
    /// A missing or malformed file yields an empty list.
    pub fn pending(&self) -> Vec<String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Cancel file unreadable");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&content) {
            Ok(ids) => ids,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Cancel file malformed");
                Vec::new()
            }
        }
    }

    /// Drop `handled` IDs from the file; deletes the file once it is empty.
    pub fn acknowledge(&self, handled: &[String]) -> io::Result<()> {
        if handled.is_empty() {
            return Ok(());
        }
        let remaining: Vec<String> = self
            .pending()
            .into_iter()
            .filter(|id| !handled.contains(id))
            .collect();

        if remaining.is_empty() {
            match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        } else {
            let json = serde_json::to_string(&remaining).map_err(io::Error::other)?;
            std::fs::write(&self.path, json)
        }
    }
}
