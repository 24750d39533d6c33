//! Event types for the worker stream-json protocol.

use serde_json::Value;

/// Canonical events emitted by a worker agent.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Session start (`type: system`).
    System(SystemInfo),
    /// Assistant turn with text and tool invocations.
    Assistant(AssistantTurn),
    /// Standalone tool invocation line.
    ToolUse(ToolUse),
    /// Terminal result of the run.
    Result(WorkerResult),
    /// Any other event kind; kept only for its type name.
    Unknown { event_type: String },
}

impl WorkerEvent {
    /// Tool invocations carried by this event.
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        match self {
            Self::Assistant(turn) => turn.tool_uses.iter().collect(),
            Self::ToolUse(tool) => vec![tool],
            _ => Vec::new(),
        }
    }
}

/// Session information from the `system` event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInfo {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

/// One assistant message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssistantTurn {
    /// Concatenated text blocks.
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
}

/// A tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

/// Terminal `result` event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerResult {
    /// Whether the worker reported success.
    pub success: bool,
    pub subtype: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    /// Final text, or the error summary on failure.
    pub result: Option<String>,
    pub session_id: Option<String>,
}

impl WorkerResult {
    /// Short human-readable summary of the run.
    pub fn summary(&self) -> String {
        match (&self.result, self.success) {
            (Some(text), _) if !text.trim().is_empty() => text.trim().to_string(),
            (_, true) => "completed".to_string(),
            (_, false) => match &self.subtype {
                Some(subtype) => format!("worker reported {subtype}"),
                None => "worker reported an error".to_string(),
            },
        }
    }
}
