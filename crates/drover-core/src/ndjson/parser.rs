//! NDJSON parser for the worker stream-json protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! surfaced as `WorkerEvent::Unknown`.

use serde_json::Value;

use super::types::{AssistantTurn, SystemInfo, ToolUse, WorkerEvent, WorkerResult};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the worker's stdout.
pub fn parse_line(line: &str) -> Result<WorkerEvent> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical event.
pub fn parse_value(raw: &Value) -> Result<WorkerEvent> {
    let event_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    Ok(match event_type {
        "system" => WorkerEvent::System(SystemInfo {
            subtype: str_field(raw, "subtype"),
            session_id: str_field(raw, "session_id"),
            model: str_field(raw, "model"),
        }),
        "assistant" => WorkerEvent::Assistant(parse_assistant(raw)),
        "tool_use" => match parse_tool_use(raw) {
            Some(tool) => WorkerEvent::ToolUse(tool),
            None => WorkerEvent::Unknown {
                event_type: event_type.to_string(),
            },
        },
        "result" => WorkerEvent::Result(parse_result(raw)),
        other => WorkerEvent::Unknown {
            event_type: other.to_string(),
        },
    })
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(String::from)
}

fn parse_assistant(raw: &Value) -> AssistantTurn {
    let msg = raw.get("message").unwrap_or(raw);
    let mut turn = AssistantTurn::default();

    let Some(blocks) = msg.get("content").and_then(Value::as_array) else {
        return turn;
    };

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !turn.text.is_empty() {
                        turn.text.push('\n');
                    }
                    turn.text.push_str(text);
                }
            }
            Some("tool_use") => {
                if let Some(tool) = parse_tool_use(block) {
                    turn.tool_uses.push(tool);
                }
            }
            _ => {}
        }
    }
    turn
}

fn parse_tool_use(raw: &Value) -> Option<ToolUse> {
    let name = raw.get("name")?.as_str()?.to_string();
    Some(ToolUse {
        id: str_field(raw, "id"),
        name,
        input: raw.get("input").cloned().unwrap_or(Value::Null),
    })
}

fn parse_result(raw: &Value) -> WorkerResult {
    let subtype = str_field(raw, "subtype");

    // `is_error` wins, then an explicit `success` flag, then the subtype.
    let success = match raw.get("is_error").and_then(Value::as_bool) {
        Some(is_error) => !is_error,
        None => match raw.get("success").and_then(Value::as_bool) {
            Some(success) => success,
            None => subtype.as_deref().is_none_or(|s| s == "success"),
        },
    };

    let duration_ms = raw.get("duration_ms").and_then(Value::as_u64).or_else(|| {
        raw.get("duration")
            .and_then(Value::as_str)
            .and_then(parse_duration)
    });

    let result = str_field(raw, "result").or_else(|| match raw.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str).map(String::from),
        _ => None,
    });

    WorkerResult {
        success,
        subtype,
        duration_ms,
        cost_usd: raw
            .get("total_cost_usd")
            .or_else(|| raw.get("cost_usd"))
            .and_then(Value::as_f64),
        num_turns: raw
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        result,
        session_id: str_field(raw, "session_id"),
    }
}

/// Parse a human duration such as `"12s"`, `"1.5s"`, `"250ms"` or `"2m"`
/// into milliseconds. A bare number is taken as seconds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_duration(text: &str) -> Option<u64> {
    let text = text.trim();
    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (text, 1_000.0)
    };

    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * scale).round() as u64)
}
