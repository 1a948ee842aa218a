//! Cache mount definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sharing mode of a cache mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Concurrent readers and writers.
    #[default]
    Shared,
    /// Exclusive access while mounted.
    Locked,
}

/// A named persistent directory mounted into exec commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Cache {
    /// Absolute POSIX path of the cached directory.
    pub directory: String,

    /// The sharing mode, either `shared` or `locked`.
    #[serde(rename = "type", default)]
    pub cache_type: CacheType,
}

impl Cache {
    /// A shared cache over the given directory.
    #[must_use]
    pub fn shared(directory: impl Into<String>) -> Self {
        Cache {
            directory: directory.into(),
            cache_type: CacheType::Shared,
        }
    }

    /// A locked cache over the given directory.
    #[must_use]
    pub fn locked(directory: impl Into<String>) -> Self {
        Cache {
            directory: directory.into(),
            cache_type: CacheType::Locked,
        }
    }
}
