//! The user configuration document.
//!
//! Config is read from a `keel.json` file (human JSON: comments and trailing
//! commas are allowed) and merged over the generated plan. Sequences accept
//! the spread token `"..."`, which splices the existing generated sequence
//! at that position; a sequence without the token replaces the generated one
//! outright.

use std::collections::BTreeMap;

use keel_common::{KeelError, KeelResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{Cache, Command, Filter, Layer};

/// Default config file name looked up in the source root.
pub const CONFIG_FILE_NAME: &str = "keel.json";

/// Published URL of the config JSON schema.
pub const SCHEMA_URL: &str = "https://schema.keel-build.dev";

/// Per-step overrides from user config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StepConfig {
    /// Replacement or spliced input layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Layer>>,

    /// Replacement or spliced commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<Command>>,

    /// Variables merged over the step's variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Replacement or spliced cache keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caches: Option<Vec<String>>,

    /// Replacement or spliced secret names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,

    /// Assets merged over the step's assets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, String>,

    /// Replacement output paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    /// Replacement dependency list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,

    /// Run the step atop this image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_image: Option<String>,

    /// Parts of this step included in the final image. Defaults to the app
    /// directory when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_outputs: Option<Vec<Filter>>,
}

/// Deploy overrides from user config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeployConfig {
    /// The base layer of the runtime image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Layer>,

    /// Replacement or spliced runtime input layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Layer>>,

    /// The container start command.
    #[serde(rename = "startCommand", default, skip_serializing_if = "Option::is_none")]
    pub start_cmd: Option<String>,

    /// Variables merged over the runtime variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Replacement or spliced `PATH` prepends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,

    /// Replacement or spliced runtime OS packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apt_packages: Option<Vec<String>>,
}

/// Node provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeConfig {
    /// Override the Node.js version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Override the Bun version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bun_version: Option<String>,

    /// Prune dev dependencies before assembling the runtime image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune_deps: Option<bool>,
}

/// Python provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PythonConfig {
    /// Override the Python version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Go provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GolangConfig {
    /// Override the Go version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Which command under `cmd/` to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,

    /// Which workspace module to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_module: Option<String>,

    /// Enable CGO for non-static binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgo_enabled: Option<bool>,
}

/// Rust provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RustConfig {
    /// Override the Rust version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Which binary to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,

    /// Which Cargo workspace package to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

/// Static-site provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StaticfileConfig {
    /// Directory served as the site root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// Shell provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShellConfig {
    /// Script executed as the start command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// The user configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// The schema for this config, for editor support.
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Force provider selection instead of detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Tool name to version-constraint pins.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, String>,

    /// OS packages installed during the build.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_apt_packages: Vec<String>,

    /// Per-step overrides keyed by step name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, StepConfig>,

    /// Deploy overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,

    /// Cache definitions merged over the generated caches.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub caches: BTreeMap<String, Cache>,

    /// Secrets made available to steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Node provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Python provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonConfig>,

    /// Go provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub golang: Option<GolangConfig>,

    /// Rust provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rust: Option<RustConfig>,

    /// Static-site provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staticfile: Option<StaticfileConfig>,

    /// Shell provider block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellConfig>,
}

impl Config {
    /// Parse a config document from human JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Parse`] on invalid input.
    pub fn from_json(source: &str) -> KeelResult<Self> {
        json5::from_str(source).map_err(|e| KeelError::Parse {
            path: CONFIG_FILE_NAME.to_string(),
            format: "json".to_string(),
            cause: e.to_string(),
        })
    }

    /// Shallow-merge `overlay` over `self`: scalar fields take the overlay
    /// when present, maps are merged key-wise, sequences take the overlay
    /// when non-empty.
    #[must_use]
    pub fn merged_with(mut self, overlay: Config) -> Config {
        self.schema = overlay.schema.or(self.schema);
        self.provider = overlay.provider.or(self.provider);
        self.packages.extend(overlay.packages);
        if !overlay.build_apt_packages.is_empty() {
            self.build_apt_packages = overlay.build_apt_packages;
        }
        self.steps.extend(overlay.steps);
        self.deploy = overlay.deploy.or(self.deploy);
        self.caches.extend(overlay.caches);
        if !overlay.secrets.is_empty() {
            self.secrets = overlay.secrets;
        }
        self.node = overlay.node.or(self.node);
        self.python = overlay.python.or(self.python);
        self.golang = overlay.golang.or(self.golang);
        self.rust = overlay.rust.or(self.rust);
        self.staticfile = overlay.staticfile.or(self.staticfile);
        self.shell = overlay.shell.or(self.shell);
        self
    }

    /// The JSON schema of the config document.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Config)
    }
}

/// Splice a configured sequence over an existing one: every spread marker is
/// replaced by the existing sequence; without a marker the configured
/// sequence replaces the existing one.
pub fn splice<T: Clone>(existing: &[T], configured: &[T], is_spread: impl Fn(&T) -> bool) -> Vec<T> {
    let mut out = Vec::with_capacity(configured.len() + existing.len());
    for item in configured {
        if is_spread(item) {
            out.extend_from_slice(existing);
        } else {
            out.push(item.clone());
        }
    }
    out
}

/// Splice for plain string sequences, where the marker is the literal
/// `"..."` entry.
#[must_use]
pub fn splice_strings(existing: &[String], configured: &[String]) -> Vec<String> {
    splice(existing, configured, |s| s == "...")
}
