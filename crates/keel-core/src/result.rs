//! End-to-end plan generation and the build-result envelope.

use std::collections::BTreeMap;
use std::path::PathBuf;

use keel_common::{KeelError, KeelPaths, KeelResult};
use serde::Serialize;

use crate::app::{App, Environment};
use crate::cleanse::cleanse_build_plan;
use crate::config::{CONFIG_FILE_NAME, Config};
use crate::generate::{GenerateContext, Metadata};
use crate::plan::BuildPlan;
use crate::providers::{get_provider, primary_providers, secondary_providers};
use crate::resolver::{ResolvedPackage, VersionOracle};
use crate::validate::validate_plan;

/// Guidance emitted when no provider recognizes the source tree.
pub const DEFAULT_START_COMMAND_HELP: &str =
    "Keel could not find a provider for this app.\n\n\
     Tell Keel how to start it by creating a keel.json in the project root:\n\n\
       {\n\
         \"deploy\": { \"startCommand\": \"...\" }\n\
       }\n\n\
     or force a provider with the `provider` field or KEEL_SHELL_SCRIPT / \
     KEEL_STATIC_FILE_ROOT environment variables.";

/// Severity of a generation log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Possible problem, generation continued.
    Warn,
    /// Generation failed.
    Error,
}

/// A structured log line carried on the build result.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub msg: String,
}

impl LogRecord {
    /// An info record.
    #[must_use]
    pub fn info(msg: impl Into<String>) -> Self {
        LogRecord {
            level: LogLevel::Info,
            msg: msg.into(),
        }
    }

    /// An error record.
    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        LogRecord {
            level: LogLevel::Error,
            msg: msg.into(),
        }
    }
}

/// Options for one generation run.
#[derive(Debug, Default)]
pub struct GenerateOptions {
    /// Explicit config file path; overrides discovery in the source tree.
    pub config_file: Option<PathBuf>,
    /// Tool cache root; the shared default when unset.
    pub cache_root: Option<PathBuf>,
}

/// The outcome of plan generation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// Whether generation succeeded.
    pub success: bool,
    /// The generated plan; absent on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<BuildPlan>,
    /// The provider that planned the build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Resolved tool versions.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_packages: BTreeMap<String, ResolvedPackage>,
    /// Facts recorded about the app.
    pub metadata: Metadata,
    /// Log records accumulated during generation.
    pub logs: Vec<LogRecord>,
}

impl BuildResult {
    /// A failure envelope for a generation error. No partial plan is ever
    /// carried on a failure.
    #[must_use]
    pub fn failure(err: &KeelError) -> Self {
        BuildResult {
            success: false,
            plan: None,
            provider: None,
            resolved_packages: BTreeMap::new(),
            metadata: Metadata::new(),
            logs: vec![LogRecord::error(error_message(err))],
        }
    }
}

/// Render an error with its recovery guidance, when it carries any.
#[must_use]
pub fn error_message(err: &KeelError) -> String {
    match err {
        KeelError::DetectionAmbiguous { help } => format!("{err}\n\n{help}"),
        KeelError::UnknownTool { tool } => {
            format!("{err}\nTry installing `{tool}` as an OS package instead")
        }
        other => other.to_string(),
    }
}

/// Generate a build plan for an app.
///
/// Runs provider detection, planning, user-config overlay, tool resolution,
/// normalization, cleansing and validation. The returned result is the
/// complete, frozen input for graph compilation.
///
/// # Errors
///
/// Any generation-phase failure; no partial plan is returned.
pub async fn generate_build_plan(
    app: App,
    env: Environment,
    oracle: &dyn VersionOracle,
    options: &GenerateOptions,
) -> KeelResult<BuildResult> {
    let config = load_config(&app, &env, options)?;
    let paths = options
        .cache_root
        .as_ref()
        .map_or_else(KeelPaths::default, KeelPaths::with_root);

    let mut ctx = GenerateContext::with_paths(app, env, config, paths)?;
    let mut logs = Vec::new();

    ctx.apply_config_packages();

    let mut provider = select_provider(&ctx)?;
    provider.initialize(&ctx)?;
    tracing::info!(provider = provider.name(), "detected provider");
    logs.push(LogRecord::info(format!("using provider {}", provider.name())));
    ctx.metadata.set("provider", provider.name());
    provider.plan(&mut ctx)?;

    for mut secondary in secondary_providers() {
        if secondary.detect(&ctx)? {
            secondary.initialize(&ctx)?;
            secondary.plan(&mut ctx)?;
            logs.push(LogRecord::info(format!(
                "applied secondary provider {}",
                secondary.name()
            )));
        }
    }

    ctx.apply_config_overrides();

    let (mut plan, resolved_packages) = ctx.generate(oracle).await?;

    plan.normalize();
    cleanse_build_plan(&mut plan);
    provider.cleanse_plan(&mut plan);

    validate_plan(&plan, Some(provider.start_command_help()))?;

    logs.push(LogRecord::info(format!(
        "generated plan with {} steps",
        plan.steps.len()
    )));

    Ok(BuildResult {
        success: true,
        plan: Some(plan),
        provider: Some(provider.name().to_string()),
        resolved_packages,
        metadata: ctx.metadata.clone(),
        logs,
    })
}

fn select_provider(ctx: &GenerateContext) -> KeelResult<Box<dyn crate::providers::Provider>> {
    if let Some(name) = &ctx.config().provider {
        return get_provider(name).ok_or_else(|| KeelError::Config {
            message: format!("unknown provider `{name}`"),
        });
    }

    for provider in primary_providers() {
        if provider.detect(ctx)? {
            return Ok(provider);
        }
    }

    Err(KeelError::DetectionAmbiguous {
        help: DEFAULT_START_COMMAND_HELP.to_string(),
    })
}

fn load_config(app: &App, env: &Environment, options: &GenerateOptions) -> KeelResult<Config> {
    if let Some(path) = &options.config_file {
        let content = std::fs::read_to_string(path).map_err(|e| KeelError::SourceUnreadable {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        return Config::from_json(&content);
    }

    if let Some((name, key)) = env.get_config_variable("CONFIG_FILE") {
        let content = app.read_file(&name).map_err(|_| KeelError::SourceUnreadable {
            path: name.clone(),
            cause: format!("config file named by {key} not found"),
        })?;
        return Config::from_json(&content);
    }

    if app.has_file(CONFIG_FILE_NAME) {
        let content = app.read_file(CONFIG_FILE_NAME)?;
        return Config::from_json(&content);
    }

    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticVersionOracle;

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

    fn options_for(dir: &tempfile::TempDir) -> GenerateOptions {
        GenerateOptions {
            config_file: None,
            cache_root: Some(dir.path().join(".keel-cache")),
        }
    }

    #[tokio::test]
    async fn empty_repo_fails_with_detection_ambiguous() {
        let dir = write_tree(&[("README.md", "# hello\n")]);
        let app = App::new(dir.path()).unwrap();
        let oracle = StaticVersionOracle::new();

        let err = generate_build_plan(app, Environment::default(), &oracle, &options_for(&dir))
            .await
            .unwrap_err();

        match &err {
            KeelError::DetectionAmbiguous { help } => {
                assert!(!help.is_empty());
                assert!(help.contains("startCommand"));
            }
            other => panic!("expected DetectionAmbiguous, got {other:?}"),
        }
        assert!(error_message(&err).contains("startCommand"));
    }

    #[tokio::test]
    async fn node_repo_generates_a_valid_plan() {
        let dir = write_tree(&[(
            "package.json",
            r#"{"scripts": {"start": "node index.js"}}"#,
        )]);
        let app = App::new(dir.path()).unwrap();
        let oracle = StaticVersionOracle::new().with_versions("node", ["22.9.0"]);

        let result = generate_build_plan(app, Environment::default(), &oracle, &options_for(&dir))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("node"));
        let plan = result.plan.unwrap();
        assert!(plan.get_step("install").is_some());
        assert_eq!(plan.deploy.start_cmd.as_deref(), Some("npm run start"));
        assert_eq!(result.resolved_packages["node"].resolved_version, "22.9.0");
    }

    #[tokio::test]
    async fn procfile_overrides_start_command() {
        let dir = write_tree(&[
            ("package.json", r#"{"scripts": {"start": "node index.js"}}"#),
            ("Procfile", "web: node server.js --procfile\n"),
        ]);
        let app = App::new(dir.path()).unwrap();
        let oracle = StaticVersionOracle::new().with_versions("node", ["22.9.0"]);

        let result = generate_build_plan(app, Environment::default(), &oracle, &options_for(&dir))
            .await
            .unwrap();

        let plan = result.plan.unwrap();
        assert_eq!(
            plan.deploy.start_cmd.as_deref(),
            Some("node server.js --procfile")
        );
    }

    #[tokio::test]
    async fn config_file_forces_provider() {
        let dir = write_tree(&[
            ("package.json", "{}"),
            ("index.html", "<html>"),
            (
                "keel.json",
                r#"{"provider": "staticfile", "deploy": {"startCommand": "caddy run"}}"#,
            ),
        ]);
        let app = App::new(dir.path()).unwrap();
        let oracle = StaticVersionOracle::new().with_versions("caddy", ["2.8.4"]);

        let result = generate_build_plan(app, Environment::default(), &oracle, &options_for(&dir))
            .await
            .unwrap();

        assert_eq!(result.provider.as_deref(), Some("staticfile"));
        assert_eq!(
            result.plan.unwrap().deploy.start_cmd.as_deref(),
            Some("caddy run")
        );
    }

    #[tokio::test]
    async fn failure_envelope_has_error_log() {
        let err = KeelError::DetectionAmbiguous {
            help: "Add a start command".to_string(),
        };
        let result = BuildResult::failure(&err);
        assert!(!result.success);
        assert!(result.plan.is_none());
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].level, LogLevel::Error);
        assert!(result.logs[0].msg.contains("Add a start command"));
    }
}
