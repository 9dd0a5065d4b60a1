//! Record, record structure and query result types

use crate::error::{HistoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The ordered field-name schema declared for a history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecordStructure {
    property_names: Vec<String>,
}

impl HistoryRecordStructure {
    /// Create a structure; field names must be unique and non-empty
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let property_names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();

        for name in &property_names {
            if !is_valid_field_name(name) {
                return Err(HistoryError::invalid_input(format!(
                    "invalid field name: {:?}",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(HistoryError::invalid_input(format!(
                    "duplicate field name: {}",
                    name
                )));
            }
        }

        Ok(Self { property_names })
    }

    pub fn property_names(&self) -> &[String] {
        &self.property_names
    }

    pub fn property_count(&self) -> usize {
        self.property_names.len()
    }
}

/// Field names become element names on disk, so they follow XML name rules
/// (without namespaces).
pub(crate) fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    if name
        .get(..3)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("xml"))
    {
        return false;
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// A timestamped set of named string values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    properties: Vec<(String, String)>,
    timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    /// Build a record from name/value pairs.
    ///
    /// A repeated name keeps its first value.
    pub fn new<I, K, V>(properties: I, timestamp: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut seen = HashSet::new();
        let properties = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| seen.insert(k.clone()))
            .collect();

        Self {
            properties,
            timestamp,
        }
    }

    /// Pair `values` positionally with the names of `structure`
    pub fn from_structure<S: AsRef<str>>(
        structure: &HistoryRecordStructure,
        values: &[S],
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if values.len() != structure.property_count() {
            return Err(HistoryError::invalid_input(format!(
                "expected {} values for record structure, got {}",
                structure.property_count(),
                values.len()
            )));
        }

        Ok(Self::new(
            structure
                .property_names()
                .iter()
                .zip(values.iter())
                .map(|(name, value)| (name.clone(), value.as_ref().to_string())),
            timestamp,
        ))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Value of the named field, if present
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(k, _)| k.as_str())
    }
}

/// Ordered snapshot of query results with a bidirectional cursor.
///
/// The cursor starts before the first element: `next_record` yields the
/// first record, `prev_record` walks back toward the start.
#[derive(Debug, Clone)]
pub struct QueryResultSet<T> {
    items: Vec<T>,
    // number of items consumed by `next_record` and not yet walked back
    position: usize,
}

impl<T> QueryResultSet<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.position < self.items.len()
    }

    pub fn has_prev(&self) -> bool {
        self.position > 0
    }

    /// Advance the cursor and return the record under it
    pub fn next_record(&mut self) -> Option<&T> {
        let item = self.items.get(self.position)?;
        self.position += 1;
        Some(item)
    }

    /// Step the cursor back and return the record it passes over
    pub fn prev_record(&mut self) -> Option<&T> {
        if self.position == 0 {
            return None;
        }
        self.position -= 1;
        self.items.get(self.position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Same records in the opposite order, cursor reset
    pub fn reversed(mut self) -> Self {
        self.items.reverse();
        self.position = 0;
        self
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> IntoIterator for QueryResultSet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a QueryResultSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
