//! The declarative build plan: the contract between generation and graph
//! compilation.
//!
//! A [`BuildPlan`] is produced once, frozen, and read-only thereafter. It is
//! serializable to deterministic JSON so plans can be diffed and snapshotted.

pub mod cache;
pub mod layer;
pub mod step;

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cache::{Cache, CacheType};
pub use layer::{Filter, Layer};
pub use step::{Command, Step};

/// Image the toolchain install step builds on.
pub const KEEL_BUILDER_IMAGE: &str = "ghcr.io/keel-build/keel-builder:latest";

/// Default base image for the runtime stage.
pub const KEEL_RUNTIME_IMAGE: &str = "ghcr.io/keel-build/keel-runtime:latest";

/// The runtime image descriptor. Not a step: assembled separately from its
/// base plus input layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Deploy {
    /// The base layer of the runtime image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Layer>,

    /// Layers copied onto the base.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Layer>,

    /// The command run in the container.
    #[serde(rename = "startCommand", default, skip_serializing_if = "Option::is_none")]
    pub start_cmd: Option<String>,

    /// Runtime environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Directories prepended to `PATH` at runtime.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// OS packages requested for the runtime image. Installation happens in
    /// a synthesized `packages:apt:runtime` step; this records the request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apt_packages: Vec<String>,
}

/// The declarative output of plan generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildPlan {
    /// Steps in generation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    /// Cache definitions addressed by step cache lists.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub caches: BTreeMap<String, Cache>,

    /// Secret names commands may receive; order-insensitive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// The runtime image descriptor.
    #[serde(default)]
    pub deploy: Deploy,
}

impl BuildPlan {
    /// Create an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Find a step by name.
    #[must_use]
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Normalize the plan in place:
    /// - drop empty layers from step and deploy inputs,
    /// - retain only steps reachable from the deploy descriptor (through
    ///   layer references and `dependsOn` edges); if the deploy references
    ///   no step at all, keep everything (partial generation),
    /// - de-duplicate and sort cache and secret lists.
    ///
    /// Normalization is idempotent.
    pub fn normalize(&mut self) {
        for step in &mut self.steps {
            step.inputs.retain(|input| !input.is_empty());
        }
        self.deploy.inputs.retain(|input| !input.is_empty());

        let reachable = self.reachable_steps();
        if !reachable.is_empty() {
            self.steps.retain(|step| reachable.contains(step.name.as_str()));
        }

        for step in &mut self.steps {
            step.caches.sort();
            step.caches.dedup();
            step.secrets.sort();
            step.secrets.dedup();
        }
        self.secrets.sort();
        self.secrets.dedup();
    }

    /// Step names transitively reachable from the deploy descriptor. Empty
    /// when the deploy references no step.
    fn reachable_steps(&self) -> BTreeSet<String> {
        let mut pending: Vec<&str> = Vec::new();
        if let Some(base) = &self.deploy.base {
            base.collect_step_refs(&mut pending);
        }
        for input in &self.deploy.inputs {
            input.collect_step_refs(&mut pending);
        }

        let mut reachable: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = pending.pop() {
            if !reachable.insert(name.to_string()) {
                continue;
            }
            if let Some(step) = self.get_step(name) {
                pending.extend(step.referenced_steps());
            }
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_chain() -> BuildPlan {
        let mut plan = BuildPlan::new();

        let mut install = Step::new("install");
        install.inputs = vec![Layer::image("node:18")];
        plan.add_step(install);

        let mut build = Step::new("build");
        build.inputs = vec![Layer::step("install")];
        plan.add_step(build);

        let mut orphan = Step::new("orphan");
        orphan.inputs = vec![Layer::image("alpine")];
        plan.add_step(orphan);

        plan.deploy.inputs = vec![Layer::step_filtered("build", Filter::includes(["."]))];
        plan
    }

    #[test]
    fn normalize_prunes_unreachable_steps() {
        let mut plan = plan_with_chain();
        plan.normalize();

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["install", "build"]);
    }

    #[test]
    fn normalize_keeps_all_when_deploy_references_nothing() {
        let mut plan = plan_with_chain();
        plan.deploy.inputs = vec![Layer::image("debian:stable-slim")];
        plan.normalize();
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn normalize_follows_depends_on() {
        let mut plan = plan_with_chain();
        plan.steps[0].depends_on = vec!["orphan".to_string()];
        plan.normalize();
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn normalize_drops_empty_layers() {
        let mut plan = plan_with_chain();
        plan.steps[1].inputs.push(Layer::Scratch);
        plan.deploy.inputs.push(Layer::Merge { layers: vec![] });
        plan.normalize();

        assert_eq!(plan.steps[1].inputs, vec![Layer::step("install")]);
        assert_eq!(plan.deploy.inputs.len(), 1);
    }

    #[test]
    fn normalize_sorts_and_dedups_lists() {
        let mut plan = plan_with_chain();
        plan.steps[1].caches = vec!["b".into(), "a".into(), "b".into()];
        plan.secrets = vec!["S2".into(), "S1".into(), "S2".into()];
        plan.normalize();

        assert_eq!(plan.steps[1].caches, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(plan.secrets, vec!["S1".to_string(), "S2".to_string()]);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut once = plan_with_chain();
        once.normalize();
        let mut twice = once.clone();
        twice.normalize();
        assert_eq!(once, twice);
    }

    #[test]
    fn plan_json_is_deterministic() {
        let plan = plan_with_chain();
        let a = serde_json::to_string(&plan).unwrap();
        let b = serde_json::to_string(&plan).unwrap();
        assert_eq!(a, b);
    }
}
