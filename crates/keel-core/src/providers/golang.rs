//! Go provider.

use keel_common::KeelResult;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::generate::GenerateContext;
use crate::plan::{Command, Filter, Layer};
use crate::resolver::VersionSource;

use super::Provider;

const DEFAULT_GO_VERSION: &str = "1.23";
const GO_BUILD_CACHE: &str = "/root/.cache/go-build";
const GO_MOD_CACHE: &str = "/go/pkg/mod";

static GO_VERSION_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^go\s+(\d+(?:\.\d+){0,2})\s*$").expect("go directive regex"));

/// Detects Go modules and workspaces and builds a static binary.
#[derive(Debug, Default)]
pub struct GolangProvider {
    go_mod: Option<String>,
    go_work: Option<String>,
}

impl GolangProvider {
    fn is_go_mod(&self) -> bool {
        self.go_mod.is_some()
    }

    fn is_go_workspace(&self) -> bool {
        self.go_work.is_some()
    }

    /// Directories under `cmd/` holding a main package.
    fn command_dirs(&self, ctx: &GenerateContext) -> Vec<String> {
        ctx.app()
            .find_directories("cmd/*")
            .into_iter()
            .filter(|dir| ctx.app().has_match(&format!("{dir}/*.go")))
            .collect()
    }

    /// Module directories listed in `go.work`.
    fn workspace_packages(&self) -> Vec<String> {
        let Some(go_work) = &self.go_work else {
            return Vec::new();
        };
        go_work
            .lines()
            .map(str::trim)
            .filter_map(|line| line.strip_prefix("./"))
            .map(ToString::to_string)
            .collect()
    }

    /// CGO is enabled via the `CGO_ENABLED` knob (env wins) or the provider
    /// config block. Disabled by default for static binaries.
    fn has_cgo_enabled(&self, ctx: &GenerateContext) -> bool {
        if let Some((value, _)) = ctx.env().get_config_variable("CGO_ENABLED") {
            return value.trim() == "1";
        }
        ctx.config()
            .golang
            .as_ref()
            .and_then(|golang| golang.cgo_enabled)
            .unwrap_or(false)
    }

    /// The `go build` package argument: a configured binary under `cmd/`,
    /// a configured workspace module, the first `cmd/` directory, or the
    /// module root.
    fn build_target(&self, ctx: &GenerateContext) -> Option<String> {
        let config = ctx.config().golang.as_ref();

        if let Some(bin) = config.and_then(|c| c.bin.as_ref()) {
            return Some(format!("./cmd/{bin}"));
        }
        if let Some(module) = config.and_then(|c| c.workspace_module.as_ref()) {
            return Some(format!("./{module}"));
        }
        if self.is_go_workspace() {
            if let Some(module) = self.workspace_packages().first() {
                return Some(format!("./{module}"));
            }
        }
        if let Some(dir) = self.command_dirs(ctx).first() {
            return Some(format!("./{dir}"));
        }
        None
    }

    fn resolve_go_version(&self, ctx: &mut GenerateContext) {
        let go = ctx.add_tool("go", DEFAULT_GO_VERSION);

        for (content, label) in [(&self.go_work, "go.work"), (&self.go_mod, "go.mod")] {
            if let Some(content) = content {
                if let Some(captures) = GO_VERSION_DIRECTIVE.captures(content) {
                    ctx.pin_tool(&go, &captures[1], label, VersionSource::Manifest);
                }
            }
        }

        if let Some(version) = ctx.config().golang.as_ref().and_then(|c| c.version.clone()) {
            ctx.pin_tool(&go, version, "golang.version", VersionSource::ProviderConfig);
        }

        ctx.pin_tool_from_env(&go, "GO_VERSION");
    }
}

impl Provider for GolangProvider {
    fn name(&self) -> &'static str {
        "golang"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(ctx.app().has_file("go.mod")
            || ctx.app().has_file("go.work")
            || ctx.app().has_match("main.go"))
    }

    fn initialize(&mut self, ctx: &GenerateContext) -> KeelResult<()> {
        self.go_mod = ctx.app().read_file("go.mod").ok();
        self.go_work = ctx.app().read_file("go.work").ok();
        Ok(())
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        self.resolve_go_version(ctx);
        let cgo_enabled = self.has_cgo_enabled(ctx);

        ctx.metadata.set_bool("goMod", self.is_go_mod());
        ctx.metadata.set_bool("goWorkspace", self.is_go_workspace());
        ctx.metadata.set_bool("goCgo", cgo_enabled);

        let mut install = ctx.new_command_step("install");
        install.add_input(Layer::step(crate::generate::MISE_STEP_NAME));
        install.secrets = Vec::new();
        if !cgo_enabled {
            install.add_variables([("CGO_ENABLED", "0")]);
        }
        if self.is_go_mod() || self.is_go_workspace() {
            for file in ["go.mod", "go.sum", "go.work", "go.work.sum"] {
                if ctx.app().has_file(file) {
                    install.add_command(Command::copy(file));
                }
            }
            if self.is_go_workspace() {
                // Module files of each workspace member are needed before
                // `go mod download` can resolve the build list.
                for module in self.workspace_packages() {
                    for file in [format!("{module}/go.mod"), format!("{module}/go.sum")] {
                        if ctx.app().has_file(&file) {
                            install.add_command(Command::copy(file));
                        }
                    }
                }
            }
            install.add_command(Command::exec("go mod download"));
        }
        install.add_cache(ctx.caches.add_cache("go-mod", GO_MOD_CACHE));
        let install_name = ctx.add_step(install);

        let mut build = ctx.new_command_step("build");
        build.add_input(Layer::step(install_name));
        build.add_input(ctx.local_layer());
        build.add_command(Command::copy("."));

        let build_cmd = match self.build_target(ctx) {
            Some(target) => format!("go build -ldflags=\"-w -s\" -o out {target}"),
            None => "go build -ldflags=\"-w -s\" -o out".to_string(),
        };
        build.add_command(Command::exec(build_cmd));
        build.add_cache(ctx.caches.add_cache("go-build", GO_BUILD_CACHE));
        build.add_cache(ctx.caches.add_cache("go-mod", GO_MOD_CACHE));
        build.outputs = Some(vec!["out".to_string()]);
        let build_name = ctx.add_step(build);

        if cgo_enabled {
            ctx.deploy.add_apt_packages(["libc6"]);
        }
        ctx.deploy
            .add_inputs([Layer::step_filtered(build_name, Filter::includes(["out"]))]);
        if ctx.deploy.start_cmd.is_none() {
            ctx.deploy.start_cmd = Some("./out".to_string());
        }

        Ok(())
    }

    fn start_command_help(&self) -> &'static str {
        "Keel builds your Go module with `go build -o out` and starts the \
         container with `./out`.\n\nIf your main package lives under cmd/, \
         set the binary with the golang.bin config field or pick a workspace \
         module with golang.workspaceModule."
    }
}
