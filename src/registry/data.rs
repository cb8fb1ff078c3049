//! Identifier and payload types for update routing
//!
//! This module defines the keys used to identify upstream sources and
//! notification targets, and the update payload fanned out to them.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Identifier of an upstream data source (e.g., "ca://SR:C01:BPM1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceLocator(String);

impl SourceLocator {
    /// Create a new source locator
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceLocator {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceLocator {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&SourceLocator> for SourceLocator {
    fn from(locator: &SourceLocator) -> Self {
        locator.clone()
    }
}

/// Identifier of a notification target (e.g., an email address or device token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationId(String);

impl DestinationId {
    /// Create a new destination id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id names no target and is never registered
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DestinationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&DestinationId> for DestinationId {
    fn from(id: &DestinationId) -> Self {
        id.clone()
    }
}

/// An update received from an upstream source
///
/// The payload is a JSON object kept behind an `Arc`, so handing the same
/// update to several dispatches never copies the fields.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateData(Arc<Map<String, Value>>);

impl UpdateData {
    /// Wrap a JSON object
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(Arc::new(fields))
    }

    /// Parse an update from raw JSON bytes
    ///
    /// Fails if the bytes are not JSON or the top-level value is not an object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }

    /// Look up a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow all fields
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Human readable name of the source that produced this update
    ///
    /// Prefers `name`, then `pvname`.
    pub fn name(&self, default: &str) -> String {
        self.get("name")
            .or_else(|| self.get("pvname"))
            .map(value_to_string)
            .unwrap_or_else(|| default.to_string())
    }

    /// Human readable value of this update, with units appended when present
    ///
    /// Prefers `char_value`, then `value`.
    pub fn display_value(&self, default: &str) -> String {
        match self.get("char_value").or_else(|| self.get("value")) {
            Some(value) => {
                let mut text = value_to_string(value);
                if let Some(units) = self.get("units") {
                    text.push_str(&value_to_string(units));
                }
                text
            }
            None => default.to_string(),
        }
    }
}

impl From<Map<String, Value>> for UpdateData {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

impl TryFrom<Value> for UpdateData {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(Error::InvalidData(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }
}

// Strings render without quotes, everything else as compact JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
