//! Identifier sanitization for generated SQL.
//!
//! Table and field names are interpolated into DDL, so they are reduced to
//! `[A-Za-z0-9_]` before use. Row values never pass through here; the trigger
//! serializes them with PostgreSQL's own JSON functions.

/// Strip every character outside `[A-Za-z0-9_]`, keeping the order of the rest.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Sanitize and double-quote an identifier for use as a column or table reference.
pub(crate) fn quote_identifier(input: &str) -> String {
    format!("\"{}\"", sanitize_identifier(input))
}
