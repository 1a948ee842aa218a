//! Builder for OS package install steps.

use crate::plan::{Command, Layer, Step};

use super::cache_context::CacheContext;

/// Accumulates apt packages installed in a dedicated step.
#[derive(Debug, Clone)]
pub struct AptStepBuilder {
    name: String,
    /// Packages to install; deduped and sorted at build time.
    pub packages: Vec<String>,
    /// Layers the step builds on.
    pub inputs: Vec<Layer>,
}

impl AptStepBuilder {
    /// Create a builder named `packages:apt:<label>`.
    #[must_use]
    pub fn new(label: &str) -> Self {
        AptStepBuilder {
            name: format!("packages:apt:{label}"),
            packages: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// The step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a package.
    pub fn add_package(&mut self, package: impl Into<String>) {
        self.packages.push(package.into());
    }

    /// Add several packages.
    pub fn add_packages<S: Into<String>>(&mut self, packages: impl IntoIterator<Item = S>) {
        self.packages.extend(packages.into_iter().map(Into::into));
    }

    /// Freeze the builder into a plan step. Apt steps never see secrets.
    #[must_use]
    pub fn build(&self, caches: &mut CacheContext) -> Step {
        let mut step = Step::new(self.name.clone());
        step.inputs = self.inputs.clone();
        step.commands = vec![apt_install_command(&self.packages, caches)];
        step.caches = caches.apt_caches();
        step.secrets = Vec::new();
        step
    }
}

/// The canonical apt install exec command for a package list.
pub fn apt_install_command(packages: &[String], caches: &mut CacheContext) -> Command {
    let mut packages: Vec<String> = packages.to_vec();
    packages.sort();
    packages.dedup();
    let joined = packages.join(" ");

    // Referenced caches are registered as a side effect so the plan always
    // declares what the command mounts.
    let _ = caches.apt_caches();

    Command::exec_named(
        format!("sh -c 'apt-get update && apt-get install -y --no-install-recommends {joined}'"),
        format!("install apt packages: {joined}"),
    )
}
