//! `package.json` model.

use std::collections::BTreeMap;

use serde::Deserialize;

/// The subset of `package.json` that drives planning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    /// The package name.
    #[serde(default)]
    pub name: Option<String>,

    /// Entry file used as a start-command fallback.
    #[serde(default)]
    pub main: Option<String>,

    /// npm scripts.
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    /// Runtime dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Development dependencies.
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,

    /// Engine constraints (`node`, `pnpm`, ...).
    #[serde(default)]
    pub engines: BTreeMap<String, String>,

    /// Corepack package manager declaration, e.g. `pnpm@9.1.0`.
    #[serde(default)]
    pub package_manager: Option<String>,
}

impl PackageJson {
    /// Whether a script with this name exists.
    #[must_use]
    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    /// The body of a script, when present.
    #[must_use]
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// Whether the package depends on `name`, in either dependency table.
    #[must_use]
    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }

    /// Split the `packageManager` field into name and version.
    #[must_use]
    pub fn package_manager_info(&self) -> Option<(&str, &str)> {
        let field = self.package_manager.as_deref()?;
        match field.split_once('@') {
            Some((name, version)) => Some((name, version)),
            None => Some((field, "")),
        }
    }
}
