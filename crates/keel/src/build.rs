//! Compile a generated plan into a backend DAG.
//!
//! This is the glue between generation and the sink: it seeds the base and
//! local layers, derives the global secrets hash, runs the graph, and
//! assembles the runtime image from the deploy descriptor.

use std::collections::BTreeMap;

use keel_common::KeelResult;
use keel_core::plan::{BuildPlan, KEEL_BUILDER_IMAGE, KEEL_RUNTIME_IMAGE, Layer};
use keel_graph::secrets::global_secrets_hash;
use keel_graph::{BuildGraph, GraphOptions, MemoryCacheStore, RecordingSink};
use serde::Serialize;

/// The compiled DAG plus the runtime-image contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledBuild {
    /// Operation log consumed by the backend.
    pub ops: serde_json::Value,
    /// Digest of the canonical op log.
    pub digest: String,
    /// Layer holding the assembled runtime image.
    pub image_state: keel_graph::LayerId,
    /// The container start command as argv.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub start_command: Vec<String>,
    /// Runtime environment variables, sorted by key.
    pub variables: BTreeMap<String, String>,
    /// The runtime `PATH` value, when paths were accumulated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Compile a frozen plan against the recording sink.
///
/// The same plan and environment always produce a byte-identical op log.
///
/// # Errors
///
/// Propagates graph-compilation failures.
pub fn compile_plan(
    plan: &BuildPlan,
    env_vars: &BTreeMap<String, String>,
    platform: &str,
) -> KeelResult<CompiledBuild> {
    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();

    let base_state = {
        use keel_graph::ImageBuilder;
        sink.image(KEEL_BUILDER_IMAGE, platform)?
    };
    let local_state = sink.local();

    let options = GraphOptions {
        platform: platform.to_string(),
        secrets_hash: global_secrets_hash(env_vars, &plan.secrets),
    };

    let mut graph = BuildGraph::new(
        plan,
        base_state,
        local_state,
        &mut sink,
        &mut cache_store,
        &options,
    )?;
    let output = graph.build()?;

    // The runtime image: the deploy base plus its input layers, routed
    // through the same merge-or-copy policy as inter-step merges.
    let mut deploy_layers = vec![
        plan.deploy
            .base
            .clone()
            .unwrap_or_else(|| Layer::image(KEEL_RUNTIME_IMAGE)),
    ];
    deploy_layers.extend(plan.deploy.inputs.iter().cloned());
    let image_state = graph.state_for_layers(&deploy_layers)?;
    drop(graph);

    // Runtime environment: the graph env is the deploy build env contract;
    // explicit deploy variables win over it.
    let mut variables = output.env.vars.clone();
    variables.extend(plan.deploy.variables.clone());

    let mut runtime_env = output.env.clone();
    for path in &plan.deploy.paths {
        runtime_env.add_path(path.clone());
    }

    Ok(CompiledBuild {
        ops: sink.to_json()?,
        digest: sink.digest()?,
        image_state,
        start_command: plan
            .deploy
            .start_cmd
            .as_deref()
            .map(start_command_argv)
            .unwrap_or_default(),
        variables,
        path: runtime_env.path_value(),
    })
}

/// Convert a start command into argv: shell-lexed when it is a simple
/// command, wrapped in `sh -c` when it uses shell syntax.
#[must_use]
pub fn start_command_argv(start_cmd: &str) -> Vec<String> {
    let needs_shell = start_cmd
        .chars()
        .any(|c| matches!(c, '&' | '|' | ';' | '<' | '>' | '$' | '(' | ')' | '`'));
    if !needs_shell {
        if let Some(argv) = shlex::split(start_cmd) {
            return argv;
        }
    }
    vec!["sh".to_string(), "-c".to_string(), start_cmd.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::plan::{Command, Filter, Step};

    fn simple_plan() -> BuildPlan {
        let mut plan = BuildPlan::new();
        let mut step = Step::new("a");
        step.inputs = vec![Layer::image("alpine")];
        step.commands = vec![Command::exec("echo hi")];
        plan.add_step(step);
        plan.deploy.inputs = vec![Layer::step_filtered("a", Filter::includes(["."]))];
        plan.deploy.start_cmd = Some("echo hi".to_string());
        plan
    }

    #[test]
    fn compile_is_deterministic() {
        let plan = simple_plan();
        let env = BTreeMap::new();
        let a = compile_plan(&plan, &env, "linux/amd64").unwrap();
        let b = compile_plan(&plan, &env, "linux/amd64").unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.ops, b.ops);
    }

    #[test]
    fn start_command_lexing() {
        assert_eq!(start_command_argv("node index.js"), vec!["node", "index.js"]);
        assert_eq!(
            start_command_argv("caddy run 2>&1"),
            vec!["sh", "-c", "caddy run 2>&1"]
        );
    }

    #[test]
    fn deploy_variables_override_graph_env() {
        let mut plan = simple_plan();
        plan.steps[0].variables.insert("MODE".into(), "build".into());
        plan.deploy.variables.insert("MODE".into(), "runtime".into());

        let compiled = compile_plan(&plan, &BTreeMap::new(), "linux/amd64").unwrap();
        assert_eq!(compiled.variables["MODE"], "runtime");
    }
}
