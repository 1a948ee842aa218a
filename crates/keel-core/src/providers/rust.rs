//! Rust provider.

use serde::Deserialize;

use keel_common::KeelResult;

use crate::generate::GenerateContext;
use crate::plan::{Command, Filter, Layer};
use crate::resolver::{VersionSource, extract_semver_token};

use super::Provider;

const DEFAULT_RUST_VERSION: &str = "1.85.1";
const CARGO_REGISTRY_CACHE: &str = "/root/.cargo/registry";
const CARGO_GIT_CACHE: &str = "/root/.cargo/git";

/// See <https://doc.rust-lang.org/cargo/reference/manifest.html>.
#[derive(Debug, Clone, Default, Deserialize)]
struct CargoManifest {
    #[serde(default)]
    package: Option<CargoPackage>,
    #[serde(default)]
    workspace: Option<CargoWorkspace>,
    #[serde(default)]
    bin: Vec<CargoBin>,
    #[serde(default)]
    lib: Option<toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CargoPackage {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    edition: Option<String>,
    #[serde(default, rename = "rust-version")]
    rust_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CargoWorkspace {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default, rename = "default-members")]
    default_members: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CargoBin {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RustToolchainFile {
    #[serde(default)]
    toolchain: ToolchainSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ToolchainSpec {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Detects Cargo projects and builds a release binary.
#[derive(Debug, Default)]
pub struct RustProvider {
    manifest: CargoManifest,
}

impl RustProvider {
    /// Minimum toolchain implied by the manifest edition.
    fn edition_floor(edition: &str) -> Option<&'static str> {
        match edition {
            "2015" => Some("1.30.0"),
            "2018" => Some("1.55.0"),
            "2021" => Some("1.84.0"),
            "2024" => Some("1.85.1"),
            _ => None,
        }
    }

    fn toolchain_file(ctx: &GenerateContext) -> Option<RustToolchainFile> {
        if let Ok(file) = ctx.app().read_toml::<RustToolchainFile>("rust-toolchain.toml") {
            return Some(file);
        }
        // The older bare file just holds the channel as plain text.
        let content = ctx.app().read_file("rust-toolchain").ok()?;
        Some(RustToolchainFile {
            toolchain: ToolchainSpec {
                channel: Some(content.trim().to_string()),
                version: None,
            },
        })
    }

    fn resolve_rust_version(&self, ctx: &mut GenerateContext) {
        let rust = ctx.add_tool("rust", DEFAULT_RUST_VERSION);

        if let Some(edition) = self.manifest.package.as_ref().and_then(|p| p.edition.as_deref()) {
            if let Some(floor) = Self::edition_floor(edition) {
                ctx.pin_tool(&rust, floor, "Cargo.toml", VersionSource::Provider);
            }
        }

        for file in ["rust-version.txt", ".rust-version"] {
            if let Ok(content) = ctx.app().read_file(file) {
                let version = extract_semver_token(&content);
                if !version.is_empty() {
                    ctx.pin_tool(&rust, version, file, VersionSource::RepoFile);
                }
            }
        }

        if let Some(toolchain) = Self::toolchain_file(ctx) {
            let spec = toolchain
                .toolchain
                .version
                .or(toolchain.toolchain.channel)
                .unwrap_or_default();
            let version = extract_semver_token(&spec);
            if version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                ctx.pin_tool(&rust, version, "rust-toolchain.toml", VersionSource::RepoFile);
            }
        }

        if let Some(version) = self.manifest.package.as_ref().and_then(|p| p.rust_version.clone()) {
            ctx.pin_tool(&rust, extract_semver_token(&version), "Cargo.toml", VersionSource::Manifest);
        }

        if let Some(version) = ctx.config().rust.as_ref().and_then(|c| c.version.clone()) {
            ctx.pin_tool(&rust, version, "rust.version", VersionSource::ProviderConfig);
        }

        ctx.pin_tool_from_env(&rust, "RUST_VERSION");
    }

    /// The binary package to build: config, the `CARGO_WORKSPACE` knob, a
    /// workspace member with a binary target, or the root package.
    fn resolve_binary(&self, ctx: &GenerateContext) -> Option<String> {
        if let Some(bin) = ctx.config().rust.as_ref().and_then(|c| c.bin.clone()) {
            return Some(bin);
        }
        if let Some(workspace) = ctx.config().rust.as_ref().and_then(|c| c.workspace.clone()) {
            return self.workspace_binary_for(ctx, &workspace).or(Some(workspace));
        }
        if let Some((name, _)) = ctx.env().get_config_variable("CARGO_WORKSPACE") {
            return self.workspace_binary_for(ctx, &name).or(Some(name));
        }

        if let Some(workspace) = &self.manifest.workspace {
            let ordered = workspace
                .default_members
                .iter()
                .chain(workspace.members.iter());
            for member in ordered {
                if workspace.exclude.contains(member) {
                    continue;
                }
                let dirs = if member.contains('*') || member.contains('?') {
                    ctx.app().find_directories(member)
                } else {
                    vec![member.clone()]
                };
                for dir in dirs {
                    if let Some(binary) = self.workspace_binary_for(ctx, &dir) {
                        return Some(binary);
                    }
                }
            }
        }

        self.manifest
            .package
            .as_ref()
            .and_then(|package| package.name.clone())
    }

    /// Package name of a workspace member, when it carries a binary target.
    fn workspace_binary_for(&self, ctx: &GenerateContext, member: &str) -> Option<String> {
        let manifest: CargoManifest = ctx.app().read_toml(&format!("{member}/Cargo.toml")).ok()?;
        let package = manifest.package.as_ref()?;
        let name = package.name.clone()?;
        if !manifest.bin.is_empty() || manifest.lib.is_none() {
            Some(name)
        } else {
            None
        }
    }
}

impl Provider for RustProvider {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(ctx.app().has_file("Cargo.toml"))
    }

    fn initialize(&mut self, ctx: &GenerateContext) -> KeelResult<()> {
        self.manifest = ctx.app().read_toml("Cargo.toml")?;
        Ok(())
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        self.resolve_rust_version(ctx);

        let binary = self.resolve_binary(ctx);
        ctx.metadata.set_bool("rustWorkspace", self.manifest.workspace.is_some());
        if let Some(binary) = &binary {
            ctx.metadata.set("rustBinary", binary);
        }

        let mut build = ctx.new_command_step("build");
        build.add_input(Layer::step(crate::generate::MISE_STEP_NAME));
        build.add_input(ctx.local_layer());
        build.add_command(Command::copy("."));

        let build_cmd = match (&binary, self.manifest.workspace.is_some()) {
            (Some(binary), true) => format!("cargo build --release --package {binary}"),
            _ => "cargo build --release".to_string(),
        };
        build.add_command(Command::exec(build_cmd));
        build.add_cache(ctx.caches.add_cache("cargo-registry", CARGO_REGISTRY_CACHE));
        build.add_cache(ctx.caches.add_cache("cargo-git", CARGO_GIT_CACHE));
        let build_name = ctx.add_step(build);

        if let Some(binary) = &binary {
            let binary_path = format!("target/release/{binary}");
            ctx.deploy.add_inputs([Layer::step_filtered(
                build_name,
                Filter::includes([binary_path.clone()]),
            )]);
            if ctx.deploy.start_cmd.is_none() {
                ctx.deploy.start_cmd = Some(format!("./{binary_path}"));
            }
        } else {
            ctx.deploy
                .add_inputs([Layer::step_filtered(build_name, Filter::includes(["."]))]);
        }

        Ok(())
    }

    fn start_command_help(&self) -> &'static str {
        "Keel builds your project with `cargo build --release` and starts the \
         binary named after your package.\n\nIn a Cargo workspace, select the \
         package to build with the rust.workspace config field or the \
         KEEL_CARGO_WORKSPACE environment variable."
    }
}
