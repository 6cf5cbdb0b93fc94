//! Connection-string handling: parsing, schema extraction, parameter
//! resolution and the per-connection-string enlistment capability cache.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Connection-string key naming the schema that owns the queues.
pub const QUEUE_SCHEMA_KEY: &str = "Queue Schema";

/// Connection-string key controlling transaction enlistment.
pub const ENLIST_KEY: &str = "Enlist";

// ============================================================================
// Parsing
// ============================================================================

/// One `key=value` segment of a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStringEntry {
    pub key: String,
    pub value: String,
    raw: String,
}

impl ConnectionStringEntry {
    /// True when the key matches `name`, ignoring case and surrounding space
    pub fn is(&self, name: &str) -> bool {
        self.key.eq_ignore_ascii_case(name.trim())
    }
}

/// Split a connection string into its entries.
///
/// Segments are separated by `;`. Values may be wrapped in single or double
/// quotes, inside which `;` is literal. Segments without `=` are ignored.
pub fn parse_connection_string(connection_string: &str) -> Vec<ConnectionStringEntry> {
    split_segments(connection_string)
        .into_iter()
        .filter_map(|raw| {
            let (key, value) = raw.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(ConnectionStringEntry {
                key: key.to_string(),
                value: unquote(value.trim()).to_string(),
                raw: raw.trim().to_string(),
            })
        })
        .collect()
}

fn split_segments(connection_string: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in connection_string.chars() {
        match (quote, c) {
            (None, ';') => segments.push(std::mem::take(&mut current)),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(open), c) if c == open => {
                quote = None;
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments.retain(|s| !s.trim().is_empty());
    segments
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Look up a key in a connection string, ignoring case
pub fn connection_string_value(connection_string: &str, key: &str) -> Option<String> {
    parse_connection_string(connection_string)
        .into_iter()
        .find(|entry| entry.is(key))
        .map(|entry| entry.value)
}

/// Remove the `Queue Schema` key from a connection string.
///
/// # Returns
///
/// The connection string without the key, and the schema if one was given.
pub fn extract_schema_name(connection_string: &str) -> (String, Option<String>) {
    let entries = parse_connection_string(connection_string);
    let schema = entries
        .iter()
        .find(|entry| entry.is(QUEUE_SCHEMA_KEY))
        .map(|entry| entry.value.trim().to_string())
        .filter(|schema| !schema.is_empty());

    if !entries.iter().any(|entry| entry.is(QUEUE_SCHEMA_KEY)) {
        return (connection_string.to_string(), schema);
    }

    let remaining: Vec<&str> = entries
        .iter()
        .filter(|entry| !entry.is(QUEUE_SCHEMA_KEY))
        .map(|entry| entry.raw.as_str())
        .collect();
    (remaining.join(";"), schema)
}

/// Whether connections opened with this string join ambient transactions.
///
/// Only an explicit `Enlist=false` disables enlistment.
pub fn connection_supports_enlistment(connection_string: &str) -> bool {
    !matches!(
        connection_string_value(connection_string, ENLIST_KEY),
        Some(value) if value.trim().eq_ignore_ascii_case("false")
    )
}

// ============================================================================
// Connection Parameters
// ============================================================================

/// Resolved connection string and schema for one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    connection_string: String,
    schema: Option<String>,
}

impl ConnectionParams {
    /// Resolve parameters where specific values override defaults.
    ///
    /// Values are trimmed, and a blank or whitespace-only value counts as
    /// absent, so a blank specific value falls back to its default.
    ///
    /// # Errors
    ///
    /// Fails when neither a specific nor a default connection string is set.
    pub fn new(
        specific_connection_string: Option<&str>,
        specific_schema: Option<&str>,
        default_connection_string: &str,
        default_schema: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let connection_string = first_non_blank(specific_connection_string, Some(default_connection_string))
            .ok_or_else(|| ConfigurationError::Missing {
                key: "connection_string".to_string(),
            })?;

        Ok(Self {
            connection_string,
            schema: first_non_blank(specific_schema, default_schema),
        })
    }

    /// Derive parameters for a destination that may override either value
    pub fn make_specific(
        &self,
        specific_connection_string: Option<&str>,
        specific_schema: Option<&str>,
    ) -> Self {
        Self {
            connection_string: first_non_blank(specific_connection_string, None)
                .unwrap_or_else(|| self.connection_string.clone()),
            schema: first_non_blank(specific_schema, self.schema.as_deref()),
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }
}

fn first_non_blank(specific: Option<&str>, fallback: Option<&str>) -> Option<String> {
    [specific, fallback]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Enlistment Capability Cache
// ============================================================================

/// Memoised enlistment capability per distinct connection string.
///
/// Shared by every polling loop through an `Arc`.
#[derive(Debug, Default)]
pub struct EnlistmentCache {
    entries: RwLock<HashMap<String, bool>>,
}

impl EnlistmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the connection string supports enlistment, computing it once
    pub fn can_enlist(&self, connection_string: &str) -> bool {
        if let Some(cached) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_string)
        {
            return *cached;
        }

        let capable = connection_supports_enlistment(connection_string);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection_string.to_string())
            .or_insert(capable);
        capable
    }

    /// Number of distinct connection strings seen so far
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
