//! Header field collection
//!
//! Ordered name/value pairs with case-insensitive lookups. Order and
//! duplicates are preserved exactly because raw packets are replayed as
//! written, including repeated fields.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Header fields that carry HTTP/1 connection semantics and must not be
/// forwarded in an HTTP/2 header block
pub const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Ordered header collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// Append a field; fields past [`MAX_HEADERS`] are dropped
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.fields.len() >= MAX_HEADERS {
            tracing::debug!(limit = MAX_HEADERS, "header limit reached, field dropped");
            return;
        }
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name` in arrival order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over all fields
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Consume into the raw pair list
    pub fn into_vec(self) -> Vec<(String, String)> {
        self.fields
    }

    /// Whether `name` is a connection-specific HTTP/1 field
    pub fn is_connection_specific(name: &str) -> bool {
        CONNECTION_SPECIFIC.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    /// Split a `Name: value` line
    ///
    /// Surrounding whitespace is trimmed from both parts.
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let colon = line
            .find(':')
            .ok_or_else(|| Error::InvalidHeader(format!("no colon in header line: {}", line)))?;
        let name = line[..colon].trim();
        if name.is_empty() {
            return Err(Error::InvalidHeader("empty header name".to_string()));
        }
        Ok((name.to_string(), line[colon + 1..].trim().to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
