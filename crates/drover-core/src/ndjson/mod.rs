//! NDJSON parser for the worker agent's stream-json protocol.
//!
//! Parses newline-delimited JSON from the worker's stdout into a small set of
//! canonical events, implementing a tolerant reader pattern.

mod parser;
mod types;

pub use parser::{parse_duration, parse_line, parse_value};
pub use types::*;
