//! Declarative value extraction from arbitrary supplier JSON.
//!
//! An expression is a list of alternatives separated by `||`, e.g.
//! `data.stock||result[0].qty||stock`. Each alternative is a sequence of dotted
//! field names and bracketed array indices. Alternatives are tried left to right
//! and the first one that fully resolves to a non-null value wins. A malformed
//! alternative, a missing field, an out-of-range index or a type mismatch only
//! abandons that alternative.
use serde_json::Value;

pub const FALLBACK_SEPARATOR: &str = "||";

/// One traversal step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Returns the first non-null value selected by `expr`, or `None`.
pub fn extract(body: &Value, expr: &str) -> Option<Value> {
    extract_with(body, expr, |value| Some(value.clone()))
}

/// Like [`extract`], but an alternative only wins if its value coerces to a count.
/// A value like `"n/a"` therefore falls through to the next alternative.
pub fn extract_count(body: &Value, expr: &str) -> Option<i64> {
    extract_with(body, expr, coerce_count)
}

/// Alternatives of `expr` that can never match because they do not parse.
pub fn invalid_alternatives(expr: &str) -> Vec<&str> {
    expr.split(FALLBACK_SEPARATOR)
        .filter(|alternative| parse_path(alternative).is_none())
        .collect()
}

fn extract_with<T>(body: &Value, expr: &str, accept: impl Fn(&Value) -> Option<T>) -> Option<T> {
    expr.split(FALLBACK_SEPARATOR)
        .filter_map(parse_path)
        .find_map(|segments| resolve(body, &segments).and_then(&accept))
}

fn resolve<'a>(body: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = body;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name)?,
            (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Parse one alternative. `None` means the alternative is malformed.
fn parse_path(alternative: &str) -> Option<Vec<Segment>> {
    let alternative = alternative.trim();
    if alternative.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for part in alternative.split('.') {
        let (name, mut brackets) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            segments.push(Segment::Field(name.to_string()));
        } else if brackets.is_empty() {
            // `a..b` or a leading/trailing dot
            return None;
        }

        while !brackets.is_empty() {
            let inner = brackets.strip_prefix('[')?;
            let close = inner.find(']')?;
            let index = inner[..close].trim().parse::<usize>().ok()?;
            segments.push(Segment::Index(index));
            brackets = &inner[close + 1..];
        }
    }
    Some(segments)
}

/// Integer coercion used for stock counts.
///
/// Integers pass through, floats truncate, strings drop `.`/`,` grouping separators
/// and must then be an optionally signed run of digits.
pub fn coerce_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_u64().map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
            .or_else(|| number.as_f64().map(|f| f.trunc() as i64)),
        Value::String(text) => parse_grouped_integer(text),
        _ => None,
    }
}

fn parse_grouped_integer(text: &str) -> Option<i64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != '.' && *c != ',')
        .collect();

    let digits = cleaned
        .strip_prefix('-')
        .or_else(|| cleaned.strip_prefix('+'))
        .unwrap_or(&cleaned);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<i64>().ok()
}
