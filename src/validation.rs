use crate::errors::{ExportError, ExportResult, ServiceError, ServiceResult};
use regex::Regex;
use std::sync::OnceLock;

// Plain column names only; no qualifiers, quotes or expressions.
fn column_identifier_regex() -> &'static Regex {
    static COLUMN_REGEX: OnceLock<Regex> = OnceLock::new();
    COLUMN_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap())
}

/// Reject filter fields that cannot be used verbatim as a column reference.
pub fn validate_column_identifier(field: &str) -> ExportResult<()> {
    if column_identifier_regex().is_match(field) {
        Ok(())
    } else {
        Err(ExportError::InvalidFilter(field.to_string()))
    }
}

/// Double-quote a validated identifier for SQL.
pub fn quote_identifier(field: &str) -> String {
    format!("\"{}\"", field)
}

/// Build a `LIKE` pattern that matches `value` anywhere, treating `%`, `_`
/// and `\` in the value literally. Pair with `ESCAPE '\'`.
pub fn substring_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Parse a report id coming from a path segment.
pub fn parse_report_id(raw: &str) -> ServiceResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ServiceError::Validation("invalid ID format".to_string()))
}
