//! JSON extraction from agent stdout.
//!
//! Agents are told to emit a single JSON object, but wrap it in prose or
//! markdown fences often enough that extraction tries, in order: the whole
//! stdout, the last code-fenced block, the last balanced-brace span.

use serde_json::Value;

/// Extract a JSON object from raw agent stdout.
pub fn extract_json(stdout: &str) -> Option<Value> {
    whole_output(stdout)
        .or_else(|| last_fenced_block(stdout))
        .or_else(|| last_balanced_span(stdout))
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn whole_output(stdout: &str) -> Option<Value> {
    parse_object(stdout)
}

fn last_fenced_block(stdout: &str) -> Option<Value> {
    let mut result = None;
    let mut rest = stdout;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let block = &after_open[..close];
        // Skip the language identifier line if present (e.g. "json").
        let content = match block.find('\n') {
            Some(newline) => &block[newline + 1..],
            None => block,
        };
        if let Some(value) = parse_object(content) {
            result = Some(value);
        }
        rest = &after_open[close + 3..];
    }
    result
}

fn last_balanced_span(stdout: &str) -> Option<Value> {
    let bytes = stdout.as_bytes();
    let mut result = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_end(stdout, i) {
                if let Some(value) = parse_object(&stdout[i..=end]) {
                    result = Some(value);
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    result
}

/// Index of the brace closing the span opened at `start`, respecting strings.
fn balanced_end(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
