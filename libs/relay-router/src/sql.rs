//! Rule SQL: the `SELECT * FROM '<topic filter>'` form used by rule
//! definitions. Only the whole-message projection over a single topic filter
//! is understood.

use relay_api::{RelayError, TopicFilter};

/// Rule SQL of the stream ingestion rule when a rule names no predicate.
pub const DEFAULT_STREAM_RULE_SQL: &str = "SELECT * FROM 'iot/stream'";
/// Rule SQL of the disconnection rule when a rule names no predicate.
pub const DEFAULT_QUEUE_RULE_SQL: &str = "SELECT * FROM 'iot/queue'";

pub fn parse_rule_sql(sql: &str) -> Result<TopicFilter, RelayError> {
    let unsupported = |what: &str| RelayError::config(format!("rule sql '{sql}': {what}"));

    let rest = strip_keyword(sql.trim(), "SELECT").ok_or_else(|| unsupported("expected SELECT"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('*')
        .ok_or_else(|| unsupported("only 'SELECT *' is supported"))?;
    let rest =
        strip_keyword(rest.trim_start(), "FROM").ok_or_else(|| unsupported("expected FROM"))?;
    let rest = rest.trim_start();

    let quote = match rest.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Err(unsupported("topic filter must be quoted")),
    };
    let body = &rest[1..];
    let end = body.find(quote).ok_or_else(|| unsupported("unterminated topic filter"))?;
    let filter = &body[..end];

    let tail = body[end + 1..].trim().trim_end_matches(';').trim_end();
    if !tail.is_empty() {
        return Err(unsupported(&format!("unsupported clause '{tail}'")));
    }

    TopicFilter::parse(filter).map_err(|e| e.with_context(format!("rule sql '{sql}'")))
}

/// Case-insensitive keyword that must not run into the following word.
fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &s[keyword.len()..];
    match rest.chars().next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => Some(rest),
    }
}
