//! Minimal JSON path extraction
//!
//! Supports the subset the task schema allows:
//! - $.a.b.c (dot notation)
//! - $.a[0].b (array index)
//! - a.b.c (without $ prefix)
//!
//! No filters, wildcards, or slices.

use serde_json::Value;

use crate::error::RunnerError;

/// A parsed path segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn unsupported(path: &str) -> RunnerError {
    RunnerError::Path {
        path: path.to_string(),
        reason: "is not a supported path (use $.a.b or $.a[0].b)".to_string(),
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, RunnerError> {
    let trimmed = match path.strip_prefix("$.") {
        Some(rest) => rest,
        None if path == "$" => return Ok(vec![]),
        None => path,
    };

    if trimmed.is_empty() {
        return Ok(vec![]);
    }

    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            return Err(unsupported(path));
        }

        match part.find('[') {
            Some(bracket) => {
                if !part.ends_with(']') {
                    return Err(unsupported(path));
                }
                let field = &part[..bracket];
                if !field.is_empty() {
                    segments.push(Segment::Field(field.to_string()));
                }
                let index: usize = part[bracket + 1..part.len() - 1]
                    .parse()
                    .map_err(|_| unsupported(path))?;
                segments.push(Segment::Index(index));
            }
            None => match part.parse::<usize>() {
                // Numeric segment as array index (e.g., "items.0")
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Field(part.to_string())),
            },
        }
    }

    Ok(segments)
}

/// Walk `path` into `value`, borrowing all the way down.
/// Returns an error when the path is malformed or matches nothing.
pub fn extract<'a>(value: &'a Value, path: &str) -> Result<&'a Value, RunnerError> {
    let mut current = value;
    for segment in parse(path)? {
        current = match segment {
            Segment::Field(ref name) => current.get(name),
            Segment::Index(idx) => current.get(idx),
        }
        .ok_or_else(|| RunnerError::Path {
            path: path.to_string(),
            reason: "matched nothing".to_string(),
        })?;
    }
    Ok(current)
}

/// Like [`extract`] but absence is `None` instead of an error. Used
/// by websocket message filters, where a non-matching message is
/// simply skipped.
pub fn try_extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    extract(value, path).ok()
}
