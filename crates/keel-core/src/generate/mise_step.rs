//! Builder for the toolchain install step.
//!
//! Resolved tool versions are installed with mise: the step writes a
//! generated `mise.toml`, runs `mise install` atop the builder image and
//! exports its shim directory on `PATH` for every downstream step.

use std::collections::BTreeMap;

use keel_common::{KeelError, KeelResult};
use serde::Serialize;

use crate::plan::{Command, KEEL_BUILDER_IMAGE, Layer, Filter, Step};
use crate::resolver::ResolvedPackage;

use super::cache_context::CacheContext;

/// Name of the toolchain install step.
pub const MISE_STEP_NAME: &str = "packages:mise";

/// Root of the mise installation inside the build image.
pub const MISE_INSTALL_DIR: &str = "/mise";

/// Paths downstream steps take from the toolchain layer.
pub const MISE_OUTPUT_PATHS: [&str; 2] = ["/mise/shims", "/mise/installs"];

#[derive(Serialize)]
struct MiseConfig {
    tools: BTreeMap<String, MiseTool>,
}

#[derive(Serialize)]
struct MiseTool {
    version: String,
}

/// Accumulates the tools the selected provider needs.
#[derive(Debug, Clone, Default)]
pub struct MiseStepBuilder {
    /// Tool names installed by this step.
    pub packages: Vec<String>,
    /// Extra variables for the install commands (e.g. corepack opt-in).
    pub variables: BTreeMap<String, String>,
    /// Explicit ordering dependencies (e.g. a build apt step).
    pub depends_on: Vec<String>,
}

impl MiseStepBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The step name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        MISE_STEP_NAME
    }

    /// Record that a tool is installed by this step.
    pub fn add_package(&mut self, tool: impl Into<String>) {
        let tool = tool.into();
        if !self.packages.contains(&tool) {
            self.packages.push(tool);
        }
    }

    /// The layer downstream steps should build on: the shim and install
    /// directories of this step's output.
    #[must_use]
    pub fn layer(&self) -> Layer {
        Layer::step_filtered(MISE_STEP_NAME, Filter::includes(MISE_OUTPUT_PATHS))
    }

    /// Freeze the builder into a plan step using the resolved versions.
    ///
    /// # Errors
    ///
    /// Fails when the generated mise config cannot be serialized.
    pub fn build(
        &self,
        resolved: &BTreeMap<String, ResolvedPackage>,
        caches: &mut CacheContext,
    ) -> KeelResult<Step> {
        let mut step = Step::new(MISE_STEP_NAME);
        step.inputs = vec![Layer::image(KEEL_BUILDER_IMAGE)];
        step.secrets = Vec::new();
        step.depends_on = self.depends_on.clone();

        step.variables = BTreeMap::from([
            ("MISE_CACHE_DIR".to_string(), format!("{MISE_INSTALL_DIR}/cache")),
            ("MISE_CONFIG_DIR".to_string(), MISE_INSTALL_DIR.to_string()),
            ("MISE_DATA_DIR".to_string(), MISE_INSTALL_DIR.to_string()),
            ("MISE_INSTALLS_DIR".to_string(), format!("{MISE_INSTALL_DIR}/installs")),
            ("MISE_SHIMS_DIR".to_string(), format!("{MISE_INSTALL_DIR}/shims")),
        ]);
        step.variables.extend(self.variables.clone());

        let mut tools: BTreeMap<String, MiseTool> = BTreeMap::new();
        for package in &self.packages {
            if let Some(resolved) = resolved.get(package) {
                tools.insert(
                    package.clone(),
                    MiseTool {
                        version: resolved.resolved_version.clone(),
                    },
                );
            }
        }

        if !tools.is_empty() {
            let names: Vec<String> = tools.keys().cloned().collect();
            let config = MiseConfig { tools };
            let rendered = toml::to_string_pretty(&config).map_err(|e| KeelError::Internal {
                message: format!("failed to render mise config: {e}"),
            })?;

            step.assets.insert("mise.toml".to_string(), rendered);
            step.add_commands([
                Command::File {
                    name: "mise.toml".to_string(),
                    path: "/etc/mise/config.toml".to_string(),
                    mode: None,
                    custom_name: Some("create mise config".to_string()),
                },
                Command::exec_named(
                    "sh -c 'mise trust -a && mise install'",
                    format!("install mise packages: {}", names.join(", ")),
                ),
                Command::path(format!("{MISE_INSTALL_DIR}/shims")),
            ]);
            step.caches = vec![caches.add_cache("mise", format!("{MISE_INSTALL_DIR}/cache"))];
        }

        Ok(step)
    }
}
