//! End-to-end graph compilation tests against the recording sink.

use std::collections::BTreeMap;

use keel_common::KeelError;
use keel_core::plan::{BuildPlan, Command, Filter, Layer, Step};
use keel_graph::{
    BuildGraph, BuildGraphOutput, GraphOptions, MemoryCacheStore, Op, RecordingSink,
    SYSTEM_DEFAULT_PATH,
};
use proptest::prelude::*;

const PLATFORM: &str = "linux/amd64";
const BUILDER_IMAGE: &str = "ghcr.io/keel-build/keel-builder:latest";

fn compile(plan: &BuildPlan, secrets_hash: Option<&str>) -> (RecordingSink, BuildGraphOutput) {
    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();

    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();

    let options = GraphOptions {
        platform: PLATFORM.to_string(),
        secrets_hash: secrets_hash.map(ToString::to_string),
    };
    let mut graph =
        BuildGraph::new(plan, base, local, &mut sink, &mut cache_store, &options).unwrap();
    let output = graph.build().unwrap();
    drop(graph);
    (sink, output)
}

fn runs(sink: &RecordingSink) -> Vec<&Op> {
    sink.ops()
        .iter()
        .filter(|op| matches!(op, Op::Run { .. }))
        .collect()
}

#[test]
fn single_parent_step_runs_atop_its_image() {
    let mut plan = BuildPlan::new();
    let mut step = Step::new("a");
    step.inputs = vec![Layer::image("alpine")];
    step.commands = vec![Command::exec("echo hi")];
    plan.add_step(step);
    plan.deploy.inputs = vec![Layer::step("a")];

    let (sink, output) = compile(&plan, None);

    let image_id = sink
        .ops()
        .iter()
        .position(|op| matches!(op, Op::Image { reference, .. } if reference == "alpine"))
        .expect("alpine image imported");

    let run_ops = runs(&sink);
    assert_eq!(run_ops.len(), 1);
    match run_ops[0] {
        Op::Run { state, argv, options } => {
            assert_eq!(*state, image_id);
            assert_eq!(argv, &["sh", "-c", "echo hi"]);
            assert_eq!(options.cwd, "/app");
            assert!(options.secrets.is_empty());
        }
        _ => unreachable!(),
    }

    // The only leaf is step a, so the graph output is its run state.
    let run_id = sink
        .ops()
        .iter()
        .position(|op| matches!(op, Op::Run { .. }))
        .unwrap();
    assert_eq!(output.state, run_id);
}

#[test]
fn environment_threads_down_the_graph_sorted() {
    let mut plan = BuildPlan::new();

    let mut parent = Step::new("parent");
    parent.inputs = vec![Layer::image("alpine")];
    parent.variables.insert("ZED".to_string(), "1".to_string());
    parent.variables.insert("ALPHA".to_string(), "2".to_string());
    parent.commands = vec![Command::path("/mise/shims")];
    plan.add_step(parent);

    let mut child = Step::new("child");
    child.inputs = vec![Layer::step("parent")];
    child.commands = vec![Command::exec("env")];
    plan.add_step(child);

    plan.deploy.inputs = vec![Layer::step("child")];

    let (sink, output) = compile(&plan, None);

    // The child writes inherited vars in sorted key order before its PATH.
    let child_envs: Vec<(&str, &str)> = sink
        .ops()
        .iter()
        .filter_map(|op| match op {
            Op::AddEnv { key, value, .. } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
        .collect();
    let alpha = child_envs.iter().rposition(|(k, _)| *k == "ALPHA").unwrap();
    let zed = child_envs.iter().rposition(|(k, _)| *k == "ZED").unwrap();
    assert!(alpha < zed, "vars must be written in sorted key order");

    let path_value = child_envs
        .iter()
        .rev()
        .find(|(k, _)| *k == "PATH")
        .map(|(_, v)| *v)
        .expect("child has PATH");
    assert_eq!(path_value, format!("/mise/shims:{SYSTEM_DEFAULT_PATH}"));

    assert_eq!(output.env.vars["ALPHA"], "2");
    assert_eq!(output.env.paths, vec!["/mise/shims".to_string()]);
}

#[test]
fn variable_command_updates_downstream_env() {
    let mut plan = BuildPlan::new();

    let mut parent = Step::new("parent");
    parent.inputs = vec![Layer::image("alpine")];
    parent.commands = vec![Command::variable("NODE_ENV", "production")];
    plan.add_step(parent);

    let mut child = Step::new("child");
    child.inputs = vec![Layer::step("parent")];
    plan.add_step(child);
    plan.deploy.inputs = vec![Layer::step("child")];

    let (_sink, output) = compile(&plan, None);
    assert_eq!(output.env.vars["NODE_ENV"], "production");
}

#[test]
fn multi_parent_merge_copies_in_dependency_order() {
    let mut plan = BuildPlan::new();
    for name in ["a", "b"] {
        let mut step = Step::new(name);
        step.inputs = vec![Layer::image("alpine")];
        step.commands = vec![Command::exec(format!("touch /{name}"))];
        plan.add_step(step);
    }

    let mut joined = Step::new("joined");
    joined.depends_on = vec!["a".to_string(), "b".to_string()];
    joined.commands = vec![Command::exec("ls /")];
    plan.add_step(joined);
    plan.deploy.inputs = vec![Layer::step("joined")];

    let (sink, _output) = compile(&plan, None);

    // Scratch plus one whole-rootfs copy per parent, a first, b second
    // (last parent wins on conflicts).
    let copy_names: Vec<&str> = sink
        .ops()
        .iter()
        .filter_map(|op| match op {
            Op::Copy {
                custom_name: Some(name),
                src_path,
                ..
            } if src_path == "/" => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(copy_names, vec!["copy from a", "copy from b"]);
}

#[test]
fn outputs_project_onto_the_step_base() {
    let mut plan = BuildPlan::new();
    let mut compile_step = Step::new("compile");
    compile_step.inputs = vec![Layer::image("golang:1.23")];
    compile_step.commands = vec![Command::exec("go build -o /build/app ./...")];
    compile_step.outputs = Some(vec!["/build/app".to_string()]);
    plan.add_step(compile_step);
    plan.deploy.inputs = vec![Layer::step("compile")];

    let (sink, output) = compile(&plan, None);

    let run_id = sink
        .ops()
        .iter()
        .position(|op| matches!(op, Op::Run { .. }))
        .unwrap();
    let image_id = sink
        .ops()
        .iter()
        .position(|op| matches!(op, Op::Image { reference, .. } if reference == "golang:1.23"))
        .unwrap();

    // The final state copies only the declared output from the run state
    // back onto the pre-command base.
    match &sink.ops()[output.state] {
        Op::Copy {
            dst,
            src,
            src_path,
            dest_path,
            ..
        } => {
            assert_eq!(*dst, image_id);
            assert_eq!(*src, run_id);
            assert_eq!(src_path, "/build/app");
            assert_eq!(dest_path, "/build/app");
        }
        other => panic!("expected a projection copy, got {other:?}"),
    }
}

#[test]
fn multiple_outputs_collect_through_scratch() {
    let mut plan = BuildPlan::new();
    let mut step = Step::new("compile");
    step.inputs = vec![Layer::image("golang:1.23")];
    step.commands = vec![Command::exec("make")];
    step.outputs = Some(vec!["/build/app".to_string(), "/build/config".to_string()]);
    plan.add_step(step);
    plan.deploy.inputs = vec![Layer::step("compile")];

    let (sink, output) = compile(&plan, None);
    match &sink.ops()[output.state] {
        Op::Copy { custom_name, .. } => {
            assert_eq!(custom_name.as_deref(), Some("combined outputs: compile"));
        }
        other => panic!("expected combined-outputs copy, got {other:?}"),
    }
}

#[test]
fn cycles_are_reported_with_a_path() {
    let mut plan = BuildPlan::new();
    let mut a = Step::new("a");
    a.depends_on = vec!["b".to_string()];
    let mut b = Step::new("b");
    b.depends_on = vec!["a".to_string()];
    plan.add_step(a);
    plan.add_step(b);

    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();
    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();
    let options = GraphOptions {
        platform: PLATFORM.to_string(),
        secrets_hash: None,
    };
    let mut graph =
        BuildGraph::new(&plan, base, local, &mut sink, &mut cache_store, &options).unwrap();

    match graph.build() {
        Err(KeelError::CyclicGraph { path }) => {
            assert!(path.contains("a") && path.contains("b"), "path: {path}");
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn unknown_cache_is_an_error() {
    let mut plan = BuildPlan::new();
    let mut step = Step::new("a");
    step.inputs = vec![Layer::image("alpine")];
    step.commands = vec![Command::exec("true")];
    step.caches = vec!["ghost".to_string()];
    plan.add_step(step);

    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();
    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();
    let options = GraphOptions::default();
    let mut graph =
        BuildGraph::new(&plan, base, local, &mut sink, &mut cache_store, &options).unwrap();

    assert!(matches!(
        graph.build(),
        Err(KeelError::UnknownCache { name }) if name == "ghost"
    ));
}

#[test]
fn missing_asset_is_an_error() {
    let mut plan = BuildPlan::new();
    let mut step = Step::new("a");
    step.inputs = vec![Layer::image("alpine")];
    step.commands = vec![Command::file("nope", "/etc/nope")];
    plan.add_step(step);

    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();
    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();
    let options = GraphOptions::default();
    let mut graph =
        BuildGraph::new(&plan, base, local, &mut sink, &mut cache_store, &options).unwrap();

    assert!(matches!(
        graph.build(),
        Err(KeelError::AssetMissing { name }) if name == "nope"
    ));
}

fn secrets_plan(step_secrets: &[&str]) -> BuildPlan {
    let mut plan = BuildPlan::new();
    plan.secrets = vec!["API_KEY".to_string(), "DB_URL".to_string()];
    let mut step = Step::new("install");
    step.inputs = vec![Layer::image("alpine")];
    step.commands = vec![Command::exec("npm install")];
    step.secrets = step_secrets.iter().map(ToString::to_string).collect();
    plan.add_step(step);
    plan.deploy.inputs = vec![Layer::step("install")];
    plan
}

#[test]
fn wildcard_secrets_mount_the_global_hash() {
    let plan = secrets_plan(&["*"]);
    let (sink, _output) = compile(&plan, Some("deadbeef"));

    let run = runs(&sink)
        .into_iter()
        .find(|op| matches!(op, Op::Run { argv, .. } if argv[2] == "npm install"))
        .unwrap();
    match run {
        Op::Run { options, .. } => {
            assert_eq!(options.secrets, vec!["API_KEY", "DB_URL"]);
            assert_eq!(options.mounts.len(), 1);
            assert_eq!(options.mounts[0].path, "/secrets-hash");
        }
        _ => unreachable!(),
    }
}

#[test]
fn subset_secrets_hash_only_the_used_names() {
    let plan = secrets_plan(&["API_KEY"]);
    let (sink, _output) = compile(&plan, Some("deadbeef"));

    // The helper chain hashes exactly the used secret.
    let hash_run = runs(&sink)
        .into_iter()
        .find(|op| {
            matches!(op, Op::Run { options, .. }
                if options.custom_name.as_deref() == Some("[keel] hash used secrets"))
        })
        .unwrap();
    match hash_run {
        Op::Run { argv, options, .. } => {
            assert!(argv[2].contains("$API_KEY"));
            assert!(!argv[2].contains("$DB_URL"));
            assert_eq!(options.secrets, vec!["API_KEY"]);
        }
        _ => unreachable!(),
    }

    let install_run = runs(&sink)
        .into_iter()
        .find(|op| matches!(op, Op::Run { argv, .. } if argv[2] == "npm install"))
        .unwrap();
    match install_run {
        Op::Run { options, .. } => {
            assert_eq!(options.mounts.len(), 1);
            assert_eq!(options.mounts[0].path, "/used-secrets-hash");
        }
        _ => unreachable!(),
    }
}

#[test]
fn secret_set_changes_the_emitted_dag() {
    let one = secrets_plan(&["API_KEY"]);
    let both = secrets_plan(&["API_KEY", "DB_URL"]);

    let (sink_one, _) = compile(&one, Some("deadbeef"));
    let (sink_both, _) = compile(&both, Some("deadbeef"));
    assert_ne!(sink_one.digest().unwrap(), sink_both.digest().unwrap());
}

#[test]
fn same_plan_emits_byte_identical_dags() {
    let plan = secrets_plan(&["API_KEY"]);
    let (sink_a, _) = compile(&plan, Some("deadbeef"));
    let (sink_b, _) = compile(&plan, Some("deadbeef"));

    assert_eq!(
        serde_json::to_string(&sink_a.to_json().unwrap()).unwrap(),
        serde_json::to_string(&sink_b.to_json().unwrap()).unwrap()
    );
    assert_eq!(sink_a.digest().unwrap(), sink_b.digest().unwrap());
}

#[test]
fn deploy_layers_with_disjoint_includes_use_native_merge() {
    let mut plan = BuildPlan::new();
    for name in ["a", "b"] {
        let mut step = Step::new(name);
        step.inputs = vec![Layer::image("alpine")];
        step.commands = vec![Command::exec(format!("touch /{name}"))];
        plan.add_step(step);
    }
    plan.deploy.base = Some(Layer::image("debian:stable-slim"));
    plan.deploy.inputs = vec![
        Layer::step_filtered("a", Filter::includes(["/x"])),
        Layer::step_filtered("b", Filter::includes(["/y"])),
    ];

    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();
    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();
    let options = GraphOptions::default();
    let mut graph =
        BuildGraph::new(&plan, base, local, &mut sink, &mut cache_store, &options).unwrap();
    graph.build().unwrap();

    let mut layers = vec![plan.deploy.base.clone().unwrap()];
    layers.extend(plan.deploy.inputs.iter().cloned());
    graph.state_for_layers(&layers).unwrap();
    drop(graph);

    assert!(
        sink.ops().iter().any(|op| matches!(op, Op::Merge { .. })),
        "disjoint includes should use the native merge"
    );
}

#[test]
fn overlapping_deploy_layers_fall_back_to_copies() {
    let mut plan = BuildPlan::new();
    for name in ["a", "b"] {
        let mut step = Step::new(name);
        step.inputs = vec![Layer::image("alpine")];
        step.commands = vec![Command::exec("true")];
        plan.add_step(step);
    }
    plan.deploy.base = Some(Layer::image("debian:stable-slim"));
    plan.deploy.inputs = vec![
        Layer::step_filtered("a", Filter::includes(["/x"])),
        Layer::step_filtered("b", Filter::includes(["/x", "/z"])),
    ];

    let mut sink = RecordingSink::new();
    let mut cache_store = MemoryCacheStore::new();
    let base = {
        use keel_graph::ImageBuilder;
        sink.image(BUILDER_IMAGE, PLATFORM).unwrap()
    };
    let local = sink.local();
    let options = GraphOptions::default();
    let mut graph =
        BuildGraph::new(&plan, base, local, &mut sink, &mut cache_store, &options).unwrap();
    graph.build().unwrap();

    let mut layers = vec![plan.deploy.base.clone().unwrap()];
    layers.extend(plan.deploy.inputs.iter().cloned());
    graph.state_for_layers(&layers).unwrap();
    drop(graph);

    assert!(
        !sink.ops().iter().any(|op| matches!(op, Op::Merge { .. })),
        "overlapping includes must not use the native merge"
    );
}

#[test]
fn starting_image_overrides_parent_state() {
    let mut plan = BuildPlan::new();
    let mut parent = Step::new("parent");
    parent.inputs = vec![Layer::image("alpine")];
    plan.add_step(parent);

    let mut child = Step::new("child");
    child.depends_on = vec!["parent".to_string()];
    child.starting_image = Some("node:22".to_string());
    child.commands = vec![Command::exec("node --version")];
    plan.add_step(child);
    plan.deploy.inputs = vec![Layer::step("child")];

    let (sink, _output) = compile(&plan, None);
    let node_image = sink
        .ops()
        .iter()
        .position(|op| matches!(op, Op::Image { reference, .. } if reference == "node:22"))
        .expect("starting image imported");
    let run = runs(&sink)
        .into_iter()
        .find(|op| matches!(op, Op::Run { argv, .. } if argv[2] == "node --version"))
        .unwrap();
    match run {
        Op::Run { state, .. } => assert_eq!(*state, node_image),
        _ => unreachable!(),
    }
}

#[test]
fn cache_mounts_carry_sharing_modes() {
    let mut plan = BuildPlan::new();
    plan.caches.insert(
        "apt".to_string(),
        keel_core::plan::Cache::locked("/var/cache/apt"),
    );
    plan.caches.insert(
        "npm".to_string(),
        keel_core::plan::Cache::shared("/root/.npm"),
    );
    let mut step = Step::new("install");
    step.inputs = vec![Layer::image("alpine")];
    step.commands = vec![Command::exec("npm ci")];
    step.caches = vec!["apt".to_string(), "npm".to_string()];
    plan.add_step(step);
    plan.deploy.inputs = vec![Layer::step("install")];

    let (sink, _output) = compile(&plan, None);
    match runs(&sink)[0] {
        Op::Run { options, .. } => {
            assert_eq!(options.caches.len(), 2);
            assert_eq!(options.caches[0].directory, "/var/cache/apt");
            assert_eq!(
                format!("{:?}", options.caches[0].sharing).to_lowercase(),
                "locked"
            );
            assert_eq!(options.caches[1].directory, "/root/.npm");
        }
        _ => unreachable!(),
    }
}

prop_compose! {
    fn include_set()(paths in prop::collection::vec("[a-c/]{1,4}", 0..4)) -> Vec<String> {
        paths
    }
}

proptest! {
    // should_merge is true exactly when no two layers share an include path.
    #[test]
    fn merge_predicate_matches_pairwise_overlap(sets in prop::collection::vec(include_set(), 0..5)) {
        let layers: Vec<Layer> = sets
            .iter()
            .map(|includes| Layer::step_filtered("s", Filter::includes(includes.iter().cloned())))
            .collect();

        let mut any_overlap = false;
        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                if keel_graph::has_path_overlap(a, b) {
                    any_overlap = true;
                }
            }
        }

        prop_assert_eq!(keel_graph::should_merge_layers(&layers), !any_overlap);
    }
}

#[test]
fn empty_plan_returns_base_state() {
    let plan = BuildPlan::new();
    let (sink, output) = compile(&plan, None);
    assert_eq!(output.state, 0);
    assert!(matches!(&sink.ops()[0], Op::Image { reference, .. } if reference == BUILDER_IMAGE));
    assert!(output.env.vars.is_empty());
}

#[test]
fn unused_secret_value_change_leaves_dag_identical() {
    // The secrets hash covers declared secrets; a step using a subset gets a
    // helper chain keyed only on the used names, so the per-step artifact
    // derivation in the DAG does not change shape with unused values.
    let plan = secrets_plan(&["API_KEY"]);
    let env1: BTreeMap<String, String> = [
        ("API_KEY".to_string(), "k".to_string()),
        ("DB_URL".to_string(), "a".to_string()),
    ]
    .into();
    let env2: BTreeMap<String, String> = [
        ("API_KEY".to_string(), "k".to_string()),
        ("DB_URL".to_string(), "b".to_string()),
    ]
    .into();

    let names = vec!["API_KEY".to_string()];
    let hash1 = keel_graph::secrets::global_secrets_hash(&env1, &names).unwrap();
    let hash2 = keel_graph::secrets::global_secrets_hash(&env2, &names).unwrap();
    assert_eq!(hash1, hash2);

    let (sink1, _) = compile(&plan, Some(&hash1));
    let (sink2, _) = compile(&plan, Some(&hash2));
    assert_eq!(sink1.digest().unwrap(), sink2.digest().unwrap());
}
