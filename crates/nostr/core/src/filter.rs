//! Canonicalization of REQ/COUNT filter objects.
//!
//! Relays disagree on how forgiving they are about filter shapes, so every
//! outbound filter is cleaned into one canonical form first: deduplicated
//! string arrays for `ids`/`authors`/`#` tag queries, deduplicated floored
//! integers for `kinds`, floored integers for `since`/`until`/`limit`.
//! Unrecognized or empty fields are dropped, and a filter that normalizes
//! to an empty object is discarded entirely.

use serde_json::{Map, Value};

/// Normalize one filter object into its canonical shape.
///
/// Returns `None` when the input is not an object or nothing usable
/// survives normalization.
pub fn normalize_count_filter(filter: &Value) -> Option<Value> {
    let object = filter.as_object()?;
    let mut normalized = Map::new();

    if let Some(kinds) = object.get("kinds") {
        let collected = collect_integer_array(kinds);
        if !collected.is_empty() {
            normalized.insert("kinds".to_string(), Value::from(collected));
        }
    }

    let ids = collect_string_array(object.get("ids"));
    if !ids.is_empty() {
        normalized.insert("ids".to_string(), Value::from(ids));
    }

    let authors = collect_string_array(object.get("authors"));
    if !authors.is_empty() {
        normalized.insert("authors".to_string(), Value::from(authors));
    }

    for (key, value) in object {
        if !key.starts_with('#') {
            continue;
        }
        let tag_values = collect_string_array(Some(value));
        if !tag_values.is_empty() {
            normalized.insert(key.clone(), Value::from(tag_values));
        }
    }

    if let Some(since) = object.get("since").and_then(coerce_integer) {
        normalized.insert("since".to_string(), Value::from(since));
    }

    if let Some(until) = object.get("until").and_then(coerce_integer) {
        normalized.insert("until".to_string(), Value::from(until));
    }

    if let Some(limit) = object.get("limit").and_then(coerce_integer)
        && limit >= 0
    {
        normalized.insert("limit".to_string(), Value::from(limit));
    }

    if normalized.is_empty() {
        None
    } else {
        Some(Value::Object(normalized))
    }
}

/// Normalize a batch of filters, discarding the ones that end up empty.
pub fn normalize_count_filters(filters: &[Value]) -> Vec<Value> {
    filters.iter().filter_map(normalize_count_filter).collect()
}

/// Floored integer coercion: accepts JSON numbers and numeric strings.
fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|v| v.is_finite()).map(floor_to_i64),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(floor_to_i64),
        _ => None,
    }
}

fn floor_to_i64(value: f64) -> i64 {
    value.floor() as i64
}

/// Deduplicated trimmed strings; a bare string counts as a one-element list.
fn collect_string_array(value: Option<&Value>) -> Vec<String> {
    let mut collected: Vec<String> = Vec::new();
    let mut push = |item: &Value| {
        if let Some(text) = item.as_str() {
            let trimmed = text.trim();
            if !trimmed.is_empty() && !collected.iter().any(|seen| seen == trimmed) {
                collected.push(trimmed.to_string());
            }
        }
    };

    match value {
        Some(Value::Array(items)) => items.iter().for_each(&mut push),
        Some(item) => push(item),
        None => {}
    }

    collected
}

/// Deduplicated floored integers; a bare number counts as a one-element list.
fn collect_integer_array(value: &Value) -> Vec<i64> {
    let mut collected: Vec<i64> = Vec::new();
    let mut push = |item: &Value| {
        if let Some(parsed) = coerce_integer(item)
            && !collected.contains(&parsed)
        {
            collected.push(parsed);
        }
    };

    match value {
        Value::Array(items) => items.iter().for_each(&mut push),
        item => push(item),
    }

    collected
}
