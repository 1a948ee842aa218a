//! Environment state threaded through the step graph.

use std::collections::BTreeMap;

/// The default Unix `PATH` appended after accumulated path entries.
pub const SYSTEM_DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Variables and `PATH` entries a step exports to its descendants.
///
/// Variables merge with last-writer-wins in merge order; path entries keep
/// insertion order with duplicates dropped (first occurrence wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    /// Environment variables, sorted by key for deterministic emission.
    pub vars: BTreeMap<String, String>,
    /// `PATH` prepends in insertion order.
    pub paths: Vec<String>,
}

impl BuildEnvironment {
    /// An empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, overwriting any previous value.
    pub fn add_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Append a path entry unless already present.
    pub fn add_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Merge another environment into this one. The other environment's
    /// variables win on conflict; its paths append after existing ones.
    pub fn merge(&mut self, other: &BuildEnvironment) {
        for (key, value) in &other.vars {
            self.vars.insert(key.clone(), value.clone());
        }
        for path in &other.paths {
            self.add_path(path.clone());
        }
    }

    /// The full `PATH` value: accumulated entries followed by the system
    /// default. `None` when no entries are accumulated.
    #[must_use]
    pub fn path_value(&self) -> Option<String> {
        if self.paths.is_empty() {
            None
        } else {
            Some(format!("{}:{SYSTEM_DEFAULT_PATH}", self.paths.join(":")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_merge_wins_for_vars() {
        let mut env = BuildEnvironment::new();
        env.add_var("NODE_ENV", "development");

        let mut other = BuildEnvironment::new();
        other.add_var("NODE_ENV", "production");
        env.merge(&other);

        assert_eq!(env.vars["NODE_ENV"], "production");
    }

    #[test]
    fn paths_dedup_first_wins() {
        let mut env = BuildEnvironment::new();
        env.add_path("/mise/shims");
        env.add_path("/app/node_modules/.bin");
        env.add_path("/mise/shims");

        assert_eq!(env.paths, vec!["/mise/shims", "/app/node_modules/.bin"]);
    }

    #[test]
    fn path_value_appends_system_default() {
        let mut env = BuildEnvironment::new();
        assert_eq!(env.path_value(), None);

        env.add_path("/mise/shims");
        assert_eq!(
            env.path_value().unwrap(),
            format!("/mise/shims:{SYSTEM_DEFAULT_PATH}")
        );
    }
}
