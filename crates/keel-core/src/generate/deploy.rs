//! Builder for the runtime image descriptor.

use std::collections::BTreeMap;

use crate::plan::{BuildPlan, Deploy, KEEL_RUNTIME_IMAGE, Layer, Step};

use super::apt_step::apt_install_command;
use super::cache_context::CacheContext;

/// Name of the synthesized runtime apt step.
pub const RUNTIME_APT_STEP_NAME: &str = "packages:apt:runtime";

/// Accumulates the deploy descriptor during generation.
#[derive(Debug, Clone, Default)]
pub struct DeployBuilder {
    /// Base layer override; the pinned runtime image when unset.
    pub base: Option<Layer>,
    /// Layers copied onto the base.
    pub inputs: Vec<Layer>,
    /// The container start command.
    pub start_cmd: Option<String>,
    /// Runtime environment variables.
    pub variables: BTreeMap<String, String>,
    /// Runtime `PATH` prepends.
    pub paths: Vec<String>,
    /// OS packages needed at runtime.
    pub apt_packages: Vec<String>,
}

impl DeployBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append runtime input layers.
    pub fn add_inputs(&mut self, layers: impl IntoIterator<Item = Layer>) {
        self.inputs.extend(layers);
    }

    /// Request OS packages in the runtime image.
    pub fn add_apt_packages<S: Into<String>>(&mut self, packages: impl IntoIterator<Item = S>) {
        for package in packages {
            let package = package.into();
            if !self.apt_packages.contains(&package) {
                self.apt_packages.push(package);
            }
        }
    }

    /// Merge variables over the runtime variables.
    pub fn add_variables<K: Into<String>, V: Into<String>>(
        &mut self,
        variables: impl IntoIterator<Item = (K, V)>,
    ) {
        for (key, value) in variables {
            self.variables.insert(key.into(), value.into());
        }
    }

    /// Whether any deploy input takes `path` from the named step. An include
    /// of `.` covers every path; a specific include covers only itself, so
    /// it never covers `.`.
    #[must_use]
    pub fn has_include_for_step(&self, name: &str, path: &str) -> bool {
        self.inputs.iter().any(|input| match input {
            Layer::Step { step, filter } if step == name => {
                filter.include.iter().any(|inc| inc == path || inc == ".")
            }
            _ => false,
        })
    }

    /// Write the deploy descriptor into the plan. When runtime apt packages
    /// were requested, a `packages:apt:runtime` step is synthesized atop the
    /// runtime base and the deploy base is retargeted at it.
    pub fn build(&self, plan: &mut BuildPlan, caches: &mut CacheContext) {
        let mut base = self
            .base
            .clone()
            .unwrap_or_else(|| Layer::image(KEEL_RUNTIME_IMAGE));

        if !self.apt_packages.is_empty() {
            let mut apt_step = Step::new(RUNTIME_APT_STEP_NAME);
            apt_step.inputs = vec![base];
            apt_step.commands = vec![apt_install_command(&self.apt_packages, caches)];
            apt_step.caches = caches.apt_caches();
            plan.add_step(apt_step);

            base = Layer::step(RUNTIME_APT_STEP_NAME);
        }

        plan.deploy = Deploy {
            base: Some(base),
            inputs: self.inputs.clone(),
            start_cmd: self.start_cmd.clone(),
            variables: self.variables.clone(),
            paths: dedup_preserving_order(&self.paths),
            apt_packages: {
                let mut packages = self.apt_packages.clone();
                packages.sort();
                packages
            },
        };
    }
}

fn dedup_preserving_order(values: &[String]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    values
        .iter()
        .filter(|v| seen.insert((*v).clone()))
        .cloned()
        .collect()
}
