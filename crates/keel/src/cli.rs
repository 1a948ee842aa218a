//! Keel CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use keel_core::app::{App, Environment};
use keel_core::config::{Config, SCHEMA_URL};
use keel_core::resolver::PassthroughOracle;
use keel_core::{BuildResult, GenerateOptions, error_message, generate_build_plan};

use crate::build::compile_plan;

/// Keel - reproducible container build plans
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Keel commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate a build plan for a directory
    Plan {
        /// App source directory
        #[arg(default_value = ".")]
        directory: PathBuf,

        /// Output file name
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Extra environment entries (KEY=VALUE)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Config file path (defaults to keel.json in the directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Output the JSON schema for the Keel config
    Schema,

    /// Compile the build plan into a backend DAG
    Build {
        /// App source directory
        #[arg(default_value = ".")]
        directory: PathBuf,

        /// Output file name
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Extra environment entries (KEY=VALUE)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Config file path (defaults to keel.json in the directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target platform
        #[arg(long, default_value = "linux/amd64")]
        platform: String,
    },
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Any generation or compilation failure; the process exits non-zero.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Plan {
                directory,
                out,
                env,
                config,
            } => {
                let result = generate(&directory, &env, config).await;
                match result {
                    Ok(result) => {
                        write_output(out.as_deref(), &result_json(&result)?)?;
                        Ok(())
                    }
                    Err(err) => {
                        // Always emit a human-readable reason plus the
                        // machine-readable failure envelope.
                        eprintln!("{}", error_message(&err));
                        let failure = BuildResult::failure(&err);
                        write_output(out.as_deref(), &serde_json::to_value(&failure)?)?;
                        Err(eyre!("plan generation failed"))
                    }
                }
            }

            Commands::Schema => {
                let schema = Config::json_schema();
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }

            Commands::Build {
                directory,
                out,
                env,
                config,
                platform,
            } => {
                let result = match generate(&directory, &env, config).await {
                    Ok(result) => result,
                    Err(err) => {
                        eprintln!("{}", error_message(&err));
                        return Err(eyre!("plan generation failed"));
                    }
                };

                let plan = result.plan.as_ref().expect("successful result has a plan");
                let env_vars = collect_env(&env)?;
                let compiled = match compile_plan(plan, &env_vars, &platform) {
                    Ok(compiled) => compiled,
                    Err(err) => {
                        eprintln!("{}", error_message(&err));
                        return Err(eyre!("graph compilation failed"));
                    }
                };

                tracing::info!(
                    digest = %compiled.digest,
                    ops = compiled.ops.as_array().map_or(0, Vec::len),
                    "compiled build graph"
                );
                write_output(out.as_deref(), &serde_json::to_value(&compiled)?)?;
                Ok(())
            }
        }
    }
}

async fn generate(
    directory: &std::path::Path,
    env_pairs: &[String],
    config_file: Option<PathBuf>,
) -> keel_common::KeelResult<BuildResult> {
    let app = App::new(directory)?;
    let env = Environment::new(collect_env(env_pairs)?);

    // Plans are generable offline: the passthrough oracle echoes requested
    // versions; a real version service can be wired in instead.
    let oracle = PassthroughOracle;
    let options = GenerateOptions {
        config_file,
        cache_root: None,
    };

    generate_build_plan(app, env, &oracle, &options).await
}

fn collect_env(pairs: &[String]) -> keel_common::KeelResult<BTreeMap<String, String>> {
    let mut env = Environment::from_os_env().variables().clone();
    let overrides = Environment::from_pairs(pairs)?;
    for (key, value) in overrides.variables() {
        env.insert(key.clone(), value.clone());
    }
    Ok(env)
}

/// The plan JSON envelope, with the config `$schema` injected for editor
/// support.
fn result_json(result: &BuildResult) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(result)?;
    if let Some(plan) = value.get_mut("plan").and_then(serde_json::Value::as_object_mut) {
        plan.insert(
            "$schema".to_string(),
            serde_json::Value::String(SCHEMA_URL.to_string()),
        );
    }
    Ok(value)
}

fn write_output(out: Option<&std::path::Path>, value: &serde_json::Value) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    match out {
        None => {
            println!("{serialized}");
        }
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, format!("{serialized}\n"))?;
            tracing::info!(path = %path.display(), "output written");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_win_over_process_env() {
        let env = collect_env(&["KEEL_TEST_OVERRIDE=yes".to_string()]).unwrap();
        assert_eq!(env.get("KEEL_TEST_OVERRIDE").map(String::as_str), Some("yes"));
    }

    #[test]
    fn invalid_env_pair_is_rejected() {
        assert!(collect_env(&["NOT_A_PAIR".to_string()]).is_err());
    }

    #[tokio::test]
    async fn plan_for_node_fixture() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"start": "node index.js"}}"#,
        )
        .unwrap();

        let result = generate(dir.path(), &[], None).await.unwrap();
        assert!(result.success);

        let json = result_json(&result).unwrap();
        assert_eq!(json["plan"]["$schema"], SCHEMA_URL);
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn plan_for_empty_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# nothing\n").unwrap();

        let err = generate(dir.path(), &[], None).await.unwrap_err();
        let failure = BuildResult::failure(&err);
        assert!(!failure.success);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["logs"][0]["level"], "error");
    }
}
