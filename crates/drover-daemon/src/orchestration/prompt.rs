//! Worker prompt construction.

use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use crate::queue::Task;

/// Render the prompt handed to a worker for `task`.
pub fn build_prompt(task: &Task, work_dir: &Path) -> String {
    let title = display_title(task);
    let mut prompt = String::new();

    let _ = writeln!(prompt, "You have been assigned a task from the work queue.");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Task ID: {}", task.id);
    let _ = writeln!(prompt, "Title: {title}");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Description:");
    let _ = writeln!(prompt, "{}", task.description.trim());
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Instructions:");
    let _ = writeln!(prompt, "1. Complete this task thoroughly");
    let _ = writeln!(
        prompt,
        "2. Work in {} unless the task specifies otherwise",
        work_dir.display()
    );
    let _ = writeln!(prompt, "3. Test your changes locally if applicable");
    let _ = writeln!(prompt, "4. When done, summarize what you accomplished");
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "IMPORTANT: Do NOT deploy anything. Your job is to write the code only."
    );
    let _ = writeln!(
        prompt,
        "Your work will be reviewed and deployed separately."
    );
    let _ = writeln!(prompt);
    prompt.push_str("Begin working on this task now.");
    prompt
}

/// Task title, or a placeholder when the queue gave none.
pub fn display_title(task: &Task) -> &str {
    let title = task.title.trim();
    if title.is_empty() {
        "Untitled task"
    } else {
        title
    }
}

/// Read the optional system-prompt addition.
///
/// Missing, unreadable or blank files yield `None`.
pub fn load_system_prompt(path: Option<&Path>) -> Option<String> {
    let path = path?;
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read agent system prompt");
            None
        }
    }
}
