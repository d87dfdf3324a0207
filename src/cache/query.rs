//! Logical read queries and the cache keys derived from them.

use std::{collections::BTreeMap, fmt};

use crate::Request;

/// A read operation plus its filter set, e.g. `list_orders{status=open}`.
///
/// Filters are kept sorted by name, so the order in which they are added
/// never matters. Setting the same filter twice keeps the last value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    operation: String,
    filters: BTreeMap<String, String>,
}

impl Query {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            filters: BTreeMap::new(),
        }
    }

    /// Builds a query from a read request: the path is the operation and
    /// the query-string parameters are the filters.
    pub fn from_request(request: &Request) -> Self {
        let mut query = Self::new(request.path());
        for (name, value) in request.query_params() {
            query.filters.insert(name.to_owned(), value.to_owned());
        }
        query
    }

    #[must_use]
    pub fn filter(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filters.insert(name.into(), value.to_string());
        self
    }

    /// Adds the filter only when `value` is present.
    #[must_use]
    pub fn filter_opt<V: fmt::Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.filter(name, value),
            None => self,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.filters.get(name).map(String::as_str)
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Deterministic cache key for a [`Query`].
///
/// Encoded as `operation?name=value&name=value` with filters sorted by name.
/// `%`, `&`, `=` and `?` inside any component are percent-escaped, so a
/// separator smuggled into a value can never make two different queries
/// share a key.
///
/// # Examples
///
/// ```
/// use rampart::cache::{CacheKey, Query};
///
/// let a = CacheKey::from_query(&Query::new("orders").filter("status", "open").filter("page", 2));
/// let b = CacheKey::from_query(&Query::new("orders").filter("page", 2).filter("status", "open"));
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "orders?page=2&status=open");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_query(query: &Query) -> Self {
        let mut key = String::with_capacity(query.operation.len() + query.filters.len() * 16);
        escape_into(&query.operation, &mut key);

        for (i, (name, value)) in query.filters.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            escape_into(name, &mut key);
            key.push('=');
            escape_into(value, &mut key);
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Query> for CacheKey {
    fn from(query: &Query) -> Self {
        Self::from_query(query)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_into(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            other => out.push(other),
        }
    }
}
