//! Query parameters accepted from the host action layer.
//!
//! List-valued parameters (`fields`, `sort`, `populate`, `searchFields`)
//! accept either an array or a string joined by commas or whitespace. The
//! `query` filter accepts an object or a JSON-encoded string. Both forms are
//! normalized at deserialization time, so the rest of the crate only sees
//! lists and maps.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ValidationDetail, ValidationError, ValidationKind};

/// Caller-supplied scope selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawScope", into = "RawScope")]
pub enum ScopeSelection {
    /// `true`: only the default scopes.
    Defaults,
    /// `false`: disable the default scopes (subject to veto).
    Disabled,
    /// Extra scope names; a `-` prefix removes a default scope.
    Named(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawScope {
    Flag(bool),
    Names(StringList),
}

impl From<RawScope> for ScopeSelection {
    fn from(raw: RawScope) -> Self {
        match raw {
            RawScope::Flag(true) => ScopeSelection::Defaults,
            RawScope::Flag(false) => ScopeSelection::Disabled,
            RawScope::Names(names) => ScopeSelection::Named(names.into_vec()),
        }
    }
}

impl From<ScopeSelection> for RawScope {
    fn from(selection: ScopeSelection) -> Self {
        match selection {
            ScopeSelection::Defaults => RawScope::Flag(true),
            ScopeSelection::Disabled => RawScope::Flag(false),
            ScopeSelection::Named(names) => RawScope::Names(StringList::Many(names)),
        }
    }
}

impl From<bool> for ScopeSelection {
    fn from(flag: bool) -> Self {
        RawScope::Flag(flag).into()
    }
}

impl From<&str> for ScopeSelection {
    fn from(names: &str) -> Self {
        ScopeSelection::Named(split_list(names))
    }
}

impl From<Vec<&str>> for ScopeSelection {
    fn from(names: Vec<&str>) -> Self {
        ScopeSelection::Named(names.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringList::One(s) => split_list(&s),
            StringList::Many(items) => items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// Splits a comma- or whitespace-joined list.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn de_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringList>::deserialize(deserializer)?.map(StringList::into_vec))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuery {
    Object(Map<String, Value>),
    Json(String),
}

fn de_query<'de, D>(deserializer: D) -> Result<Option<Map<String, Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawQuery>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawQuery::Object(map)) => Ok(Some(map)),
        Some(RawQuery::Json(s)) if s.trim().is_empty() => Ok(None),
        Some(RawQuery::Json(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(de::Error::custom("query must be a JSON object")),
            Err(e) => Err(de::Error::custom(format!("query is not valid JSON: {}", e))),
        },
    }
}

/// Parameters of a read or list call.
///
/// # Examples
///
/// ```
/// use helios_entity::params::QueryParams;
/// use serde_json::json;
///
/// let params = QueryParams::from_json(json!({
///     "fields": "title votes",
///     "sort": "-votes,title",
///     "query": "{\"status\":\"published\"}",
///     "scope": false,
/// }))
/// .unwrap();
///
/// assert_eq!(params.fields, Some(vec!["title".to_string(), "votes".to_string()]));
/// assert_eq!(params.sort, Some(vec!["-votes".to_string(), "title".to_string()]));
/// assert_eq!(params.query.unwrap()["status"], json!("published"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Field selection.
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Sort keys; a `-` prefix sorts descending.
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    /// Full-text search term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Fields the search term applies to.
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Option::is_none")]
    pub search_fields: Option<Vec<String>>,
    /// Backend-specific collation, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSelection>,
    /// Fields to populate.
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Option::is_none")]
    pub populate: Option<Vec<String>>,
    /// Filter object.
    #[serde(default, deserialize_with = "de_query", skip_serializing_if = "Option::is_none")]
    pub query: Option<Map<String, Value>>,
    /// 1-based page number for [`list`](crate::service::EntityService::list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

impl QueryParams {
    /// Creates empty parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses parameters from a JSON bag.
    ///
    /// Unknown keys are ignored. Shape errors (a non-numeric limit, an
    /// unparsable query string) are reported as a validation error.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| {
            ValidationError::single(ValidationDetail::new(
                "params",
                ValidationKind::Type,
                format!("invalid parameters: {}", e),
            ))
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = Some(sort.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_search_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<ScopeSelection>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_populate<I, S>(mut self, populate: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.populate = Some(populate.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the filter. Non-object values are ignored.
    pub fn with_query(mut self, query: Value) -> Self {
        if let Value::Object(map) = query {
            self.query = Some(map);
        }
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    /// Caps `limit` at `max_limit`.
    pub fn clamp_limit(mut self, max_limit: Option<usize>) -> Self {
        if let Some(max) = max_limit {
            self.limit = Some(self.limit.map_or(max, |limit| limit.min(max)));
        }
        self
    }

    /// Turns `page`/`page_size` into `limit`/`offset`.
    ///
    /// Returns the effective `(page, page_size)`; pages start at 1.
    pub fn paginate(&mut self, default_page_size: usize, max_limit: Option<usize>) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1);
        let mut page_size = self.page_size.unwrap_or(default_page_size).max(1);
        if let Some(max) = max_limit {
            page_size = page_size.min(max);
        }
        self.limit = Some(page_size);
        self.offset = Some((page - 1).saturating_mul(page_size));
        (page, page_size)
    }

    /// Returns the explicit field list, if any.
    pub fn field_list(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    /// Returns the filter, or an empty one.
    pub fn filter(&self) -> Map<String, Value> {
        self.query.clone().unwrap_or_default()
    }
}
