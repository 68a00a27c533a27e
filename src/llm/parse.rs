//! Structured-output parsing for model responses.
//!
//! Models wrap JSON in markdown fences and emit raw newlines inside string
//! values; both are repaired here before parsing. A parse failure is logged
//! with the cleaned text so model drift can be diagnosed from the logs, then
//! returned to the caller; the owning worker decides what turns into a
//! `failed` record.

use serde_json::Value;
use tracing::error;

use crate::error::ParseError;

/// Parse free-form model output into structured data.
///
/// Empty or whitespace-only input yields an empty array, never an error.
/// Anything else is fence-stripped, newline-repaired and parsed as JSON;
/// failures log the cleaned text exactly once and surface the error.
pub fn parse_model_output(raw: &str) -> Result<Value, ParseError> {
    let stripped = strip_code_fence(raw.trim());
    let cleaned = repair_newlines_in_strings(stripped.trim());

    if cleaned.trim().is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    match serde_json::from_str(&cleaned) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!(cleaned = %cleaned, error = %e, "Failed to parse model output");
            Err(ParseError::InvalidJson(e.to_string()))
        }
    }
}

/// Strip a markdown code fence if present; pass unfenced text through.
///
/// An opening fence with no closing fence is still stripped.
fn strip_code_fence(text: &str) -> &str {
    let body = if let Some(rest) = text.strip_prefix("```json") {
        rest
    } else if let Some(rest) = text.strip_prefix("```") {
        rest
    } else {
        return text;
    };

    let body = body.trim_start();
    match body.trim_end().strip_suffix("```") {
        Some(inner) => inner,
        None => body,
    }
}

/// Rewrite raw newlines inside JSON string literals as `\n` escapes.
///
/// Newlines between tokens are legal whitespace and left alone; only string
/// interiors are touched. Already-escaped sequences pass through untouched.
fn repair_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }

        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            // A CR only ever shows up paired with a LF in model output;
            // the LF branch emits the escape.
            '\r' => {}
            _ => out.push(c),
        }
    }

    out
}
