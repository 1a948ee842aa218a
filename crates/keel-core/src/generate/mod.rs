//! Plan generation context and step builders.
//!
//! Providers compose a plan exclusively through [`GenerateContext`]: they
//! declare tools, register step builders and fill the deploy descriptor.
//! The context then resolves tool versions and freezes everything into a
//! [`BuildPlan`].

mod apt_step;
mod cache_context;
mod command_step;
mod deploy;
mod metadata;
mod mise_step;

pub use apt_step::{AptStepBuilder, apt_install_command};
pub use cache_context::{APT_CACHE_DIR, APT_LISTS_DIR, CacheContext};
pub use command_step::CommandStepBuilder;
pub use deploy::{DeployBuilder, RUNTIME_APT_STEP_NAME};
pub use metadata::Metadata;
pub use mise_step::{MISE_INSTALL_DIR, MISE_OUTPUT_PATHS, MISE_STEP_NAME, MiseStepBuilder};

use std::collections::BTreeMap;

use keel_common::{KeelPaths, KeelResult};

use crate::app::{App, Environment};
use crate::config::{Config, splice, splice_strings};
use crate::plan::{BuildPlan, Command, Filter, Layer};
use crate::resolver::{PackageRef, ResolvedPackage, Resolver, VersionOracle, VersionSource};

/// A registered step builder of any kind.
#[derive(Debug, Clone)]
pub enum StepBuilder {
    /// A provider-authored command step.
    Command(CommandStepBuilder),
    /// An OS package install step.
    Apt(AptStepBuilder),
    /// The toolchain install step.
    Mise(MiseStepBuilder),
}

impl StepBuilder {
    /// The name of the step this builder produces.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            StepBuilder::Command(builder) => builder.name(),
            StepBuilder::Apt(builder) => builder.name(),
            StepBuilder::Mise(builder) => builder.name(),
        }
    }
}

/// Single-threaded orchestration state for one generation run.
pub struct GenerateContext {
    app: App,
    env: Environment,
    config: Config,

    /// Registered step builders in generation order.
    pub steps: Vec<StepBuilder>,
    /// Named cache registry.
    pub caches: CacheContext,
    /// Secret names accumulated from providers and config.
    pub secrets: Vec<String>,
    /// The deploy descriptor under construction.
    pub deploy: DeployBuilder,
    /// Tool-version negotiation state.
    pub resolver: Resolver,
    /// Facts recorded about the app.
    pub metadata: Metadata,

    sub_contexts: Vec<String>,
    dockerignore: Vec<String>,
}

impl GenerateContext {
    /// Create a context over an app with the default tool cache location.
    ///
    /// # Errors
    ///
    /// Fails when a present `.dockerignore` cannot be read.
    pub fn new(app: App, env: Environment, config: Config) -> KeelResult<Self> {
        Self::with_paths(app, env, config, KeelPaths::default())
    }

    /// Create a context with an explicit tool cache root (used by tests).
    ///
    /// # Errors
    ///
    /// Fails when a present `.dockerignore` cannot be read.
    pub fn with_paths(
        app: App,
        env: Environment,
        config: Config,
        paths: KeelPaths,
    ) -> KeelResult<Self> {
        let dockerignore = parse_dockerignore(&app)?;

        let mut metadata = Metadata::new();
        metadata.set_bool("dockerIgnore", !dockerignore.is_empty());

        Ok(GenerateContext {
            app,
            env,
            config,
            steps: Vec::new(),
            caches: CacheContext::new(),
            secrets: Vec::new(),
            deploy: DeployBuilder::new(),
            resolver: Resolver::new(paths),
            metadata,
            sub_contexts: Vec::new(),
            dockerignore,
        })
    }

    /// The source tree.
    #[must_use]
    pub fn app(&self) -> &App {
        &self.app
    }

    /// The configuration environment.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The user config document.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Patterns parsed from `.dockerignore`, empty when absent.
    #[must_use]
    pub fn dockerignore_excludes(&self) -> &[String] {
        &self.dockerignore
    }

    /// Enter a nested naming scope; step names render as `name:sub1:sub2`.
    pub fn enter_sub_context(&mut self, sub_context: impl Into<String>) {
        self.sub_contexts.push(sub_context.into());
    }

    /// Leave the innermost naming scope.
    pub fn exit_sub_context(&mut self) {
        self.sub_contexts.pop();
    }

    /// Render a step name inside the current naming scope.
    #[must_use]
    pub fn step_name(&self, name: &str) -> String {
        if self.sub_contexts.is_empty() {
            name.to_string()
        } else {
            format!("{name}:{}", self.sub_contexts.join(":"))
        }
    }

    /// Create (but do not register) a command step builder scoped to the
    /// current sub-context. Register it with [`GenerateContext::add_step`].
    #[must_use]
    pub fn new_command_step(&self, name: &str) -> CommandStepBuilder {
        CommandStepBuilder::new(self.step_name(name))
    }

    /// Register a command step builder, replacing any step with the same
    /// name. Returns the step name.
    pub fn add_step(&mut self, builder: CommandStepBuilder) -> String {
        let name = builder.name().to_string();
        self.steps.retain(|existing| existing.name() != name);
        self.steps.push(StepBuilder::Command(builder));
        name
    }

    /// Register an apt step installing the given packages. Returns the step
    /// name.
    pub fn add_apt_step<S: Into<String>>(
        &mut self,
        label: &str,
        packages: impl IntoIterator<Item = S>,
    ) -> String {
        let mut builder = AptStepBuilder::new(label);
        builder.add_packages(packages);
        let name = builder.name().to_string();
        self.steps.retain(|existing| existing.name() != name);
        self.steps.push(StepBuilder::Apt(builder));
        name
    }

    /// The toolchain step builder, created on first use.
    pub fn mise(&mut self) -> &mut MiseStepBuilder {
        let index = match self
            .steps
            .iter()
            .position(|builder| matches!(builder, StepBuilder::Mise(_)))
        {
            Some(index) => index,
            None => {
                self.steps.push(StepBuilder::Mise(MiseStepBuilder::new()));
                self.steps.len() - 1
            }
        };
        match &mut self.steps[index] {
            StepBuilder::Mise(builder) => builder,
            _ => unreachable!("index points at the mise builder"),
        }
    }

    /// The layer carrying the installed toolchain.
    pub fn mise_layer(&mut self) -> Layer {
        self.mise().layer()
    }

    /// Declare a tool install with a fallback version.
    pub fn add_tool(&mut self, tool: &str, fallback_version: &str) -> PackageRef {
        self.mise().add_package(tool);
        self.resolver.default(tool, fallback_version)
    }

    /// Record a version pin for a declared tool.
    pub fn pin_tool(
        &mut self,
        package: &PackageRef,
        version: impl Into<String>,
        source_label: impl Into<String>,
        source: VersionSource,
    ) {
        self.resolver.version(package, version, source_label, source);
    }

    /// Pin a tool from a `KEEL_`-prefixed environment knob when set. The
    /// matched variable name becomes the source label.
    pub fn pin_tool_from_env(&mut self, package: &PackageRef, knob: &str) {
        if let Some((version, key)) = self.env.get_config_variable(knob) {
            self.resolver
                .version(package, version, key, VersionSource::EnvVar);
        }
    }

    /// A layer over the whole local source tree.
    #[must_use]
    pub fn local_layer(&self) -> Layer {
        Layer::local()
    }

    /// Find a registered builder by step name.
    #[must_use]
    pub fn get_step(&self, name: &str) -> Option<&StepBuilder> {
        self.steps.iter().find(|builder| builder.name() == name)
    }

    /// Find a registered command step builder by name.
    pub fn get_command_step_mut(&mut self, name: &str) -> Option<&mut CommandStepBuilder> {
        self.steps.iter_mut().find_map(|builder| match builder {
            StepBuilder::Command(command) if command.name() == name => Some(command),
            _ => None,
        })
    }

    /// Apply the `packages` and `buildAptPackages` sections of the user
    /// config. Runs before provider planning so config pins participate in
    /// version negotiation at `ProviderConfig` priority.
    pub fn apply_config_packages(&mut self) {
        let packages: Vec<(String, String)> = self
            .config
            .packages
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (tool, version) in packages {
            let package = self.add_tool(&tool, &version);
            self.pin_tool(&package, version, "custom config", VersionSource::ProviderConfig);
        }

        let build_packages = self.config.build_apt_packages.clone();
        if !build_packages.is_empty() {
            let apt_name = self.add_apt_step("build", build_packages);
            self.mise().depends_on.push(apt_name);
        }
    }

    /// Apply user-config step, cache, secret and deploy overrides over the
    /// generated state. Sequences honor the `"..."` spread token.
    pub fn apply_config_overrides(&mut self) {
        let config = self.config.clone();

        for (name, step_config) in &config.steps {
            if self.get_step(name).is_some() && self.get_command_step_mut(name).is_none() {
                tracing::warn!(step = %name, "step exists but is not a command step, skipping config");
                continue;
            }

            if self.get_command_step_mut(name).is_none() {
                let builder = CommandStepBuilder::new(name.clone());
                self.add_step(builder);
            }
            let builder = self
                .get_command_step_mut(name)
                .expect("command step registered above");

            if let Some(inputs) = &step_config.inputs {
                builder.inputs = splice(&builder.inputs, inputs, |l| matches!(l, Layer::Spread));
            }
            if let Some(commands) = &step_config.commands {
                builder.commands =
                    splice(&builder.commands, commands, |c| matches!(c, Command::Spread));
            }
            builder
                .variables
                .extend(step_config.variables.clone());
            builder.assets.extend(step_config.assets.clone());
            if let Some(caches) = &step_config.caches {
                builder.caches = splice_strings(&builder.caches, caches);
            }
            if let Some(secrets) = &step_config.secrets {
                builder.secrets = splice_strings(&builder.secrets, secrets);
            }
            if let Some(outputs) = &step_config.outputs {
                builder.outputs = Some(outputs.clone());
            }
            if let Some(depends_on) = &step_config.depends_on {
                builder.depends_on = splice_strings(&builder.depends_on, depends_on);
            }
            if let Some(image) = &step_config.starting_image {
                if !image.is_empty() {
                    builder.starting_image = Some(image.clone());
                }
            }

            if let Some(deploy_outputs) = &step_config.deploy_outputs {
                let filters: Vec<Filter> = if deploy_outputs.is_empty() {
                    vec![Filter::includes(["."])]
                } else {
                    deploy_outputs
                        .iter()
                        .map(|filter| {
                            if filter.is_empty() {
                                Filter::includes(["."])
                            } else {
                                filter.clone()
                            }
                        })
                        .collect()
                };
                let layers: Vec<Layer> = filters
                    .into_iter()
                    .map(|filter| Layer::step_filtered(name.clone(), filter))
                    .collect();
                self.deploy.add_inputs(layers);
            }
        }

        for (name, cache) in &config.caches {
            self.caches.set_cache(name.clone(), cache.clone());
        }

        if !config.secrets.is_empty() {
            self.secrets = splice_strings(&self.secrets, &config.secrets);
        }

        if let Some(deploy) = &config.deploy {
            if let Some(base) = &deploy.base {
                self.deploy.base = Some(base.clone());
            }
            if let Some(inputs) = &deploy.inputs {
                self.deploy.inputs =
                    splice(&self.deploy.inputs, inputs, |l| matches!(l, Layer::Spread));
            }
            if let Some(start_cmd) = &deploy.start_cmd {
                if !start_cmd.is_empty() {
                    self.deploy.start_cmd = Some(start_cmd.clone());
                }
            }
            self.deploy.variables.extend(deploy.variables.clone());
            if let Some(paths) = &deploy.paths {
                self.deploy.paths = splice_strings(&self.deploy.paths, paths);
            }
            if let Some(packages) = &deploy.apt_packages {
                self.deploy.apt_packages =
                    splice_strings(&self.deploy.apt_packages, packages);
            }
        }
    }

    /// Resolve tool versions and freeze the accumulated state into a plan.
    ///
    /// # Errors
    ///
    /// Propagates version-resolution and step-build failures.
    pub async fn generate(
        &mut self,
        oracle: &dyn VersionOracle,
    ) -> KeelResult<(BuildPlan, BTreeMap<String, ResolvedPackage>)> {
        let resolved = self.resolver.resolve_all(oracle).await?;

        let mut plan = BuildPlan::new();
        let caches = &mut self.caches;
        for builder in &self.steps {
            let step = match builder {
                StepBuilder::Command(command) => command.build(),
                StepBuilder::Apt(apt) => apt.build(caches),
                StepBuilder::Mise(mise) => mise.build(&resolved, caches)?,
            };
            plan.add_step(step);
        }

        self.deploy.build(&mut plan, caches);

        plan.caches = self.caches.clone().into_caches();

        // Fold unique secrets: declared ones plus every name steps reference,
        // so step secret lists always resolve against the plan.
        let mut secrets = self.secrets.clone();
        for step in &plan.steps {
            secrets.extend(step.secrets.iter().filter(|s| *s != "*").cloned());
        }
        secrets.sort();
        secrets.dedup();
        plan.secrets = secrets;

        Ok((plan, resolved))
    }
}

fn parse_dockerignore(app: &App) -> KeelResult<Vec<String>> {
    if !app.has_file(".dockerignore") {
        return Ok(Vec::new());
    }

    let content = app.read_file(".dockerignore")?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}
