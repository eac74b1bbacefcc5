//! Row types shared across the database layer.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{DbError, Result};

/// One upstream row, normalized for the sync pipeline and hydration.
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// Source name this row belongs to
    pub source: String,
    /// Natural identifier normalized to text
    pub pg_id: String,
    /// Composed search text (text field plus configured extras)
    pub text: String,
    /// Full row as a JSON object, for payload fields and hydration
    pub extras: Value,
    /// Upstream watermark value, when the source has one
    pub updated_at: Option<DateTime<Utc>>,
}

/// Compose the embedding text from the text column and configured extras.
///
/// String extras are appended verbatim; array extras contribute their string
/// elements. Everything else is skipped rather than stringified, since JSON
/// punctuation would pollute the embedding input.
pub fn compose_search_text(text: &str, extras: &Value, extra_fields: &[String]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(1 + extra_fields.len());
    if !text.trim().is_empty() {
        parts.push(text.trim().to_string());
    }

    for field in extra_fields {
        match extras.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => parts.push(s.trim().to_string()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(s) = item {
                        if !s.trim().is_empty() {
                            parts.push(s.trim().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    parts.join(" ")
}

/// Compose the composite `pg_id` for content-identity keyed rows.
///
/// The separator must match the upstream view definitions; both the reader
/// and hydration go through this one helper so the encoding cannot drift.
pub fn composite_id(content_type: &str, content_source: &str, content_id: &str) -> String {
    format!("{content_type}:{content_source}:{content_id}")
}

/// Split a composite `pg_id` back into its content-identity parts.
pub fn split_composite_id(pg_id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = pg_id.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(t), Some(s), Some(i)) if !t.is_empty() && !s.is_empty() && !i.is_empty() => {
            Some((t, s, i))
        }
        _ => None,
    }
}

/// Reject identifiers that cannot be safely interpolated into SQL.
///
/// Source descriptors come from the operator's config file, but table and
/// column names still end up in query strings; restrict them to the
/// unquoted-identifier alphabet (plus `.` for schema-qualified names).
pub fn check_ident(ident: &str) -> Result<&str> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok && !ident.starts_with('.') && !ident.ends_with('.') {
        Ok(ident)
    } else {
        Err(DbError::UnsafeIdentifier(ident.to_string()))
    }
}
