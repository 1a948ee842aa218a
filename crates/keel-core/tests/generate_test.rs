//! End-to-end generation tests over real source trees.

use std::collections::BTreeMap;

use keel_common::KeelError;
use keel_core::app::{App, Environment};
use keel_core::plan::{BuildPlan, Command, Filter, Layer, Step};
use keel_core::resolver::StaticVersionOracle;
use keel_core::{GenerateOptions, generate_build_plan};
use proptest::prelude::*;

fn write_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

fn node_oracle() -> StaticVersionOracle {
    StaticVersionOracle::new().with_versions("node", ["18.20.5", "20.11.0", "22.9.0"])
}

async fn generate(
    dir: &tempfile::TempDir,
    env: &[&str],
    oracle: &StaticVersionOracle,
) -> Result<keel_core::BuildResult, KeelError> {
    let app = App::new(dir.path()).unwrap();
    let env = Environment::from_pairs(env.iter().copied()).unwrap();
    let options = GenerateOptions {
        config_file: None,
        cache_root: Some(dir.path().join(".keel-cache")),
    };
    generate_build_plan(app, env, oracle, &options).await
}

#[tokio::test]
async fn empty_repo_is_detection_ambiguous() {
    let dir = write_tree(&[("README.md", "# just docs\n")]);
    let err = generate(&dir, &[], &node_oracle()).await.unwrap_err();

    match err {
        KeelError::DetectionAmbiguous { help } => {
            assert!(help.contains("startCommand"), "help was: {help}");
        }
        other => panic!("expected DetectionAmbiguous, got {other:?}"),
    }
}

#[tokio::test]
async fn version_priority_follows_source_classes() {
    // Default "22" (builtin) < .nvmrc "18" (repo file) < env "20" (env var).
    let dir = write_tree(&[
        ("package.json", r#"{"scripts": {"start": "node index.js"}}"#),
        (".nvmrc", "18\n"),
    ]);
    let result = generate(&dir, &["KEEL_NODE_VERSION=20"], &node_oracle())
        .await
        .unwrap();

    let node = &result.resolved_packages["node"];
    assert_eq!(node.requested_version, "20");
    assert_eq!(node.source, "KEEL_NODE_VERSION");
    assert_eq!(node.resolved_version, "20.11.0");
}

#[tokio::test]
async fn nvmrc_wins_without_env_override() {
    let dir = write_tree(&[
        ("package.json", r#"{"scripts": {"start": "node index.js"}}"#),
        (".nvmrc", "18\n"),
    ]);
    let result = generate(&dir, &[], &node_oracle()).await.unwrap();

    let node = &result.resolved_packages["node"];
    assert_eq!(node.requested_version, "18");
    assert_eq!(node.source, ".nvmrc");
    assert_eq!(node.resolved_version, "18.20.5");
}

#[tokio::test]
async fn destructive_config_step_loses_node_modules_cache() {
    let dir = write_tree(&[
        (
            "package.json",
            r#"{"scripts": {"start": "node index.js", "build": "webpack"}}"#,
        ),
        ("package-lock.json", "{}"),
        (
            "keel.json",
            r#"{"steps": {"build": {"commands": ["...", "rm -rf node_modules"]}}}"#,
        ),
    ]);
    let result = generate(&dir, &[], &node_oracle()).await.unwrap();
    let plan = result.plan.unwrap();

    // The build step runs the destructive command, so the cleanser detaches
    // the node-modules cache from it; the cache itself stays declared.
    let build = plan.get_step("build").unwrap();
    assert!(build
        .commands
        .contains(&Command::exec("rm -rf node_modules")));
    assert!(!build.caches.contains(&"node-modules".to_string()));
    assert!(plan.caches.contains_key("node-modules"));

    // The install step is exempt by name even though `npm ci` matches the
    // destructive heuristic.
    let install = plan.get_step("install").unwrap();
    assert!(install.commands.contains(&Command::exec("npm ci")));
    assert!(!install.caches.is_empty());
}

#[tokio::test]
async fn benign_build_keeps_node_modules_cache() {
    let dir = write_tree(&[(
        "package.json",
        r#"{"scripts": {"start": "node index.js", "build": "webpack"}}"#,
    )]);
    let result = generate(&dir, &[], &node_oracle()).await.unwrap();
    let plan = result.plan.unwrap();

    let build = plan.get_step("build").unwrap();
    assert!(build.caches.contains(&"node-modules".to_string()));
}

#[tokio::test]
async fn generated_plans_satisfy_reference_invariants() {
    let dir = write_tree(&[
        (
            "package.json",
            r#"{"scripts": {"start": "node index.js", "build": "webpack"}}"#,
        ),
        ("package-lock.json", "{}"),
    ]);
    let result = generate(&dir, &[], &node_oracle()).await.unwrap();
    let plan = result.plan.unwrap();

    let step_names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
    for step in &plan.steps {
        for cache in &step.caches {
            assert!(plan.caches.contains_key(cache), "undeclared cache {cache}");
        }
        for secret in &step.secrets {
            assert!(
                secret == "*" || plan.secrets.contains(secret),
                "undeclared secret {secret}"
            );
        }
        for reference in step.referenced_steps() {
            assert!(step_names.contains(&reference), "dangling ref {reference}");
        }
    }
}

#[tokio::test]
async fn applying_an_empty_config_is_identity() {
    let files: &[(&str, &str)] = &[(
        "package.json",
        r#"{"scripts": {"start": "node index.js", "build": "webpack"}}"#,
    )];

    let bare = write_tree(files);
    let mut with_config: Vec<(&str, &str)> = files.to_vec();
    with_config.push(("keel.json", r#"{"steps": {}}"#));
    let configured = write_tree(&with_config);

    let plan_bare = generate(&bare, &[], &node_oracle()).await.unwrap().plan.unwrap();
    let plan_configured = generate(&configured, &[], &node_oracle())
        .await
        .unwrap()
        .plan
        .unwrap();

    assert_eq!(
        serde_json::to_value(&plan_bare).unwrap(),
        serde_json::to_value(&plan_configured).unwrap()
    );
}

#[tokio::test]
async fn plan_json_shape_is_stable() {
    let dir = write_tree(&[(
        "package.json",
        r#"{"scripts": {"start": "node index.js"}}"#,
    )]);
    let result = generate(&dir, &[], &node_oracle()).await.unwrap();
    let json = serde_json::to_value(result.plan.unwrap()).unwrap();

    assert!(json["steps"].is_array());
    assert!(json["caches"].is_object());
    assert_eq!(json["deploy"]["startCommand"], "npm run start");

    let names: Vec<&str> = json["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|step| step["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"packages:mise"));
    assert!(names.contains(&"install"));
    assert!(names.contains(&"build"));
}

#[tokio::test]
async fn secondary_procfile_runs_after_golang() {
    let dir = write_tree(&[
        ("go.mod", "module example.com/app\n\ngo 1.23\n"),
        ("main.go", "package main\n\nfunc main() {}\n"),
        ("Procfile", "web: ./out --port 8080\n"),
    ]);
    let oracle = StaticVersionOracle::new().with_versions("go", ["1.23.4"]);
    let result = generate(&dir, &[], &oracle).await.unwrap();

    assert_eq!(result.provider.as_deref(), Some("golang"));
    let plan = result.plan.unwrap();
    assert_eq!(plan.deploy.start_cmd.as_deref(), Some("./out --port 8080"));
}

// Arbitrary small plans for structural properties: steps chained by index,
// some referenced from deploy.
fn arbitrary_plan() -> impl Strategy<Value = BuildPlan> {
    (1usize..6, prop::collection::vec(any::<bool>(), 0..6)).prop_map(|(count, deploy_refs)| {
        let mut plan = BuildPlan::new();
        for i in 0..count {
            let mut step = Step::new(format!("step{i}"));
            step.inputs = if i == 0 {
                vec![Layer::image("alpine")]
            } else {
                vec![Layer::step(format!("step{}", i - 1))]
            };
            plan.add_step(step);
        }
        for (i, referenced) in deploy_refs.iter().enumerate().take(count) {
            if *referenced {
                plan.deploy.inputs.push(Layer::step_filtered(
                    format!("step{i}"),
                    Filter::includes(["."]),
                ));
            }
        }
        plan.deploy.start_cmd = Some("./app".to_string());
        plan
    })
}

proptest! {
    #[test]
    fn normalize_is_idempotent(plan in arbitrary_plan()) {
        let mut once = plan.clone();
        once.normalize();
        let mut twice = once.clone();
        twice.normalize();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn normalized_steps_are_reachable_from_deploy(plan in arbitrary_plan()) {
        let mut normalized = plan.clone();
        normalized.normalize();

        let mut reachable: Vec<String> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for input in &normalized.deploy.inputs {
            let mut refs = Vec::new();
            input.collect_step_refs(&mut refs);
            pending.extend(refs.iter().map(ToString::to_string));
        }
        let had_seed = !pending.is_empty();
        while let Some(name) = pending.pop() {
            if reachable.contains(&name) {
                continue;
            }
            reachable.push(name.clone());
            if let Some(step) = normalized.get_step(&name) {
                pending.extend(step.referenced_steps().iter().map(ToString::to_string));
            }
        }

        if had_seed {
            for step in &normalized.steps {
                prop_assert!(reachable.contains(&step.name), "unreachable step {}", step.name);
            }
        } else {
            // Degenerate plans keep everything.
            prop_assert_eq!(normalized.steps.len(), plan.steps.len());
        }
    }
}

#[tokio::test]
async fn resolver_output_is_deterministic_across_runs() {
    let files: &[(&str, &str)] = &[
        ("package.json", r#"{"scripts": {"start": "node index.js"}}"#),
        (".nvmrc", "18\n"),
    ];
    let mut outputs: Vec<BTreeMap<String, String>> = Vec::new();
    for _ in 0..2 {
        let dir = write_tree(files);
        let result = generate(&dir, &[], &node_oracle()).await.unwrap();
        outputs.push(
            result
                .resolved_packages
                .iter()
                .map(|(k, v)| (k.clone(), v.resolved_version.clone()))
                .collect(),
        );
    }
    assert_eq!(outputs[0], outputs[1]);
}
