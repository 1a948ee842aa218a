//! Generation metadata: small facts providers record about the app.

use std::collections::BTreeMap;

/// String facts collected during generation (provider name, package manager,
/// runtime flavor). Carried on the build result for logging and inspection.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(transparent)]
pub struct Metadata {
    properties: BTreeMap<String, String>,
}

impl Metadata {
    /// Create an empty metadata map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Record a boolean property; false values are stored as empty strings
    /// so `get` reads them as unset.
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "" });
    }

    /// Read a property, empty string when missing.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.properties.get(key).map(String::as_str).unwrap_or("")
    }
}
