//! Immutable configuration environment.

use std::collections::BTreeMap;

use keel_common::{KeelError, KeelResult};

/// Env-var namespace prefix for Keel configuration knobs.
pub const CONFIG_PREFIX: &str = "KEEL_";

/// An immutable map of configuration variables.
///
/// Configuration knobs are looked up under the `KEEL_` prefix first, falling
/// back to the bare name, and the matched key is reported back so callers can
/// surface where a value came from.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    variables: BTreeMap<String, String>,
}

impl Environment {
    /// Build an environment from an existing map.
    #[must_use]
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        Self { variables }
    }

    /// Build an environment from `KEY=VALUE` pairs.
    ///
    /// # Errors
    ///
    /// Returns a config error for entries without a `=`.
    pub fn from_pairs<S: AsRef<str>>(pairs: impl IntoIterator<Item = S>) -> KeelResult<Self> {
        let mut variables = BTreeMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let Some((name, value)) = pair.split_once('=') else {
                return Err(KeelError::Config {
                    message: format!("invalid environment entry `{pair}`: expected KEY=VALUE"),
                });
            };
            variables.insert(name.to_string(), value.to_string());
        }
        Ok(Self { variables })
    }

    /// Capture the calling process environment.
    #[must_use]
    pub fn from_os_env() -> Self {
        Self {
            variables: std::env::vars().collect(),
        }
    }

    /// Straight variable lookup.
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Insert a variable. Only used while assembling the environment; the
    /// map is treated as frozen during generation.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Look up a configuration knob: the first non-empty of `KEEL_<NAME>`
    /// then `<NAME>`, together with the key that matched.
    #[must_use]
    pub fn get_config_variable(&self, name: &str) -> Option<(String, String)> {
        let prefixed = format!("{CONFIG_PREFIX}{name}");
        for key in [prefixed.as_str(), name] {
            if let Some(value) = self.variables.get(key) {
                if !value.is_empty() {
                    return Some((value.clone(), key.to_string()));
                }
            }
        }
        None
    }

    /// True when a configuration knob is set to a truthy value
    /// (one of `1`, `true`, `yes`, `on`, after trimming and lowercasing).
    #[must_use]
    pub fn is_config_truthy(&self, name: &str) -> bool {
        self.get_config_variable(name)
            .map(|(value, _)| {
                matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
            })
            .unwrap_or(false)
    }

    /// Known variable names starting with the given prefix.
    #[must_use]
    pub fn secrets_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.variables
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// All variables, for callers that need the raw map (e.g. secret value
    /// hashing).
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pairs() {
        let env = Environment::from_pairs(["VAR1=value1", "VAR2=value2"]).unwrap();
        assert_eq!(env.get_variable("VAR1"), Some("value1"));
        assert_eq!(env.get_variable("VAR2"), Some("value2"));
    }

    #[test]
    fn from_pairs_rejects_bare_names() {
        assert!(Environment::from_pairs(["NOT_A_PAIR"]).is_err());
    }

    #[test]
    fn config_variable_prefers_prefixed_key() {
        let env = Environment::from_pairs(["KEEL_NODE_VERSION=20", "NODE_VERSION=18"]).unwrap();
        let (value, key) = env.get_config_variable("NODE_VERSION").unwrap();
        assert_eq!(value, "20");
        assert_eq!(key, "KEEL_NODE_VERSION");
    }

    #[test]
    fn config_variable_falls_back_to_bare_key() {
        let env = Environment::from_pairs(["NODE_VERSION=18", "KEEL_NODE_VERSION="]).unwrap();
        let (value, key) = env.get_config_variable("NODE_VERSION").unwrap();
        assert_eq!(value, "18");
        assert_eq!(key, "NODE_VERSION");
    }

    #[test]
    fn truthiness() {
        let env =
            Environment::from_pairs(["A=1", "B= TRUE ", "C=yes", "D=on", "E=0", "F=nope"]).unwrap();
        for name in ["A", "B", "C", "D"] {
            assert!(env.is_config_truthy(name), "{name} should be truthy");
        }
        for name in ["E", "F", "MISSING"] {
            assert!(!env.is_config_truthy(name), "{name} should be falsy");
        }
    }

    #[test]
    fn secrets_with_prefix() {
        let env = Environment::from_pairs(["NPM_TOKEN=x", "NODE_AUTH=y", "OTHER=z"]).unwrap();
        assert_eq!(env.secrets_with_prefix("N"), vec!["NODE_AUTH", "NPM_TOKEN"]);
    }
}
