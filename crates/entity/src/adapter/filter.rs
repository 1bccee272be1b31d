//! Document matching shared by the bundled adapters.
//!
//! Filters use a small Mongo-like vocabulary: plain equality (an array
//! field matches if it contains the value), `$eq`, `$ne`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$regex`, and the `$and` / `$or`
//! combinators. Keys may be dotted paths into nested objects.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{BackendError, EntityResult};

use super::{Document, FindParams};

/// Resolves a dotted path inside a document.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Orders two JSON values of the same kind. Mixed kinds do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(Value::Array(items)), expected) if !expected.is_array() => {
            items.iter().any(|item| loose_equals(item, expected))
        }
        (Some(actual), expected) => loose_equals(actual, expected),
    }
}

fn compares(actual: Option<&Value>, expected: &Value, accept: fn(Ordering) -> bool) -> bool {
    match actual {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, expected).is_some_and(accept)),
        Some(actual) => compare_values(actual, expected).is_some_and(accept),
        None => false,
    }
}

fn matches_operator(actual: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => equals(actual, arg),
        "$ne" => !equals(actual, arg),
        "$gt" => compares(actual, arg, |o| o == Ordering::Greater),
        "$gte" => compares(actual, arg, |o| o != Ordering::Less),
        "$lt" => compares(actual, arg, |o| o == Ordering::Less),
        "$lte" => compares(actual, arg, |o| o != Ordering::Greater),
        "$in" => arg
            .as_array()
            .is_some_and(|values| values.iter().any(|v| equals(actual, v))),
        "$nin" => arg
            .as_array()
            .is_none_or(|values| !values.iter().any(|v| equals(actual, v))),
        "$exists" => {
            let present = actual.is_some_and(|v| !v.is_null());
            present == arg.as_bool().unwrap_or(true)
        }
        "$regex" => match (actual, arg.as_str().map(Regex::new)) {
            (Some(Value::String(s)), Some(Ok(re))) => re.is_match(s),
            _ => false,
        },
        // Unknown operators match nothing.
        _ => false,
    }
}

/// Returns `true` if the document satisfies the filter.
///
/// # Examples
///
/// ```
/// use helios_entity::adapter::matches_filter;
/// use serde_json::json;
///
/// let doc = json!({"status": "active", "votes": 5, "tags": ["a", "b"]});
/// let doc = doc.as_object().unwrap();
///
/// assert!(matches_filter(doc, json!({"status": "active"}).as_object().unwrap()));
/// assert!(matches_filter(doc, json!({"votes": {"$gte": 5}, "tags": "b"}).as_object().unwrap()));
/// assert!(!matches_filter(doc, json!({"$or": [{"votes": 1}, {"status": "gone"}]}).as_object().unwrap()));
/// ```
pub fn matches_filter(doc: &Document, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => condition.as_array().is_some_and(|parts| {
            parts
                .iter()
                .all(|p| p.as_object().is_some_and(|f| matches_filter(doc, f)))
        }),
        "$or" => condition.as_array().is_some_and(|parts| {
            parts
                .iter()
                .any(|p| p.as_object().is_some_and(|f| matches_filter(doc, f)))
        }),
        _ => {
            let actual = lookup_path(doc, key);
            match condition {
                Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops
                    .iter()
                    .all(|(op, arg)| matches_operator(actual, op, arg)),
                expected => equals(actual, expected),
            }
        }
    })
}

fn matches_search(doc: &Document, term: &str, fields: &[String]) -> bool {
    let term = term.to_lowercase();
    let hit = |value: &Value| {
        value
            .as_str()
            .is_some_and(|s| s.to_lowercase().contains(&term))
    };
    if fields.is_empty() {
        doc.values().any(hit)
    } else {
        fields
            .iter()
            .any(|f| lookup_path(doc, f).is_some_and(hit))
    }
}

fn sort_documents(docs: &mut [Document], sort: &[String]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in sort {
            let (column, descending) = match key.strip_prefix('-') {
                Some(column) => (column, true),
                None => (key.strip_prefix('+').unwrap_or(key), false),
            };
            let ordering = match (lookup_path(a, column), lookup_path(b, column)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Applies filter, search, sort, offset and limit to a set of documents.
pub fn select<'a, I>(docs: I, params: &FindParams) -> Vec<Document>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut selected: Vec<Document> = docs
        .into_iter()
        .filter(|doc| matches_filter(doc, &params.filter))
        .filter(|doc| {
            params
                .search
                .as_deref()
                .is_none_or(|term| matches_search(doc, term, &params.search_fields))
        })
        .cloned()
        .collect();

    sort_documents(&mut selected, &params.sort);

    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(usize::MAX);
    selected.into_iter().skip(offset).take(limit).collect()
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

/// Applies a change set to a document.
///
/// Without `raw`, every entry overwrites its column. With `raw`, entries are
/// update operators (`$set`, `$unset`, `$inc`); plain keys are treated as
/// `$set`.
pub fn apply_changes(doc: &mut Document, changes: Document, raw: bool) -> EntityResult<()> {
    if !raw {
        for (key, value) in changes {
            doc.insert(key, value);
        }
        return Ok(());
    }

    for (op, arg) in changes {
        match op.as_str() {
            "$set" | "$unset" | "$inc" => {
                let Value::Object(fields) = arg else {
                    return Err(BackendError::QueryError {
                        message: format!("{} expects an object", op),
                    }
                    .into());
                };
                for (path, value) in fields {
                    match op.as_str() {
                        "$set" => set_path(doc, &path, value),
                        "$unset" => unset_path(doc, &path),
                        _ => {
                            let current = lookup_path(doc, &path).and_then(Value::as_f64).unwrap_or(0.0);
                            let delta = value.as_f64().ok_or_else(|| BackendError::QueryError {
                                message: format!("$inc on '{}' expects a number", path),
                            })?;
                            let sum = current + delta;
                            let next = if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                                Value::from(sum as i64)
                            } else {
                                Value::from(sum)
                            };
                            set_path(doc, &path, next);
                        }
                    }
                }
            }
            other if other.starts_with('$') => {
                return Err(BackendError::QueryError {
                    message: format!("unsupported update operator '{}'", other),
                }
                .into());
            }
            _ => set_path(doc, &op, arg),
        }
    }
    Ok(())
}
