//! Node.js provider.

mod package_json;
mod package_manager;

pub use package_json::PackageJson;
pub use package_manager::PackageManager;

use keel_common::KeelResult;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::generate::{CommandStepBuilder, GenerateContext};
use crate::plan::{Command, Filter, Layer};
use crate::resolver::VersionSource;

use super::Provider;

const DEFAULT_NODE_VERSION: &str = "22";
const DEFAULT_BUN_VERSION: &str = "latest";
const DEFAULT_PNPM_VERSION: &str = "9";

/// Corepack installation directory carried into the runtime image.
pub const COREPACK_HOME: &str = "/opt/corepack";

/// Build cache shared by tools that write under `node_modules/.cache`
/// (next, jest, webpack, ...). npm itself does not use it.
pub const NODE_MODULES_CACHE: &str = "/app/node_modules/.cache";

/// Matches `bun` or `bunx` used as a command, not as part of another word.
static BUN_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s|;|&|&&|\||\|\|)bunx?\s").expect("bun command regex"));

/// Detects `package.json` projects and plans install, build and runtime
/// assembly for npm, pnpm, bun and yarn apps.
#[derive(Debug, Default)]
pub struct NodeProvider {
    package_json: PackageJson,
    package_manager: PackageManager,
}

impl NodeProvider {
    fn uses_corepack(&self) -> bool {
        self.package_json.package_manager.is_some()
            && self.package_manager != PackageManager::Bun
    }

    fn requires_node(&self) -> bool {
        if self.package_manager != PackageManager::Bun
            || self.package_json.package_manager.is_some()
        {
            return true;
        }
        self.package_json
            .scripts
            .values()
            .any(|script| script.contains("node"))
            || self.package_json.has_dependency("astro")
            || self.package_json.has_dependency("vite")
    }

    fn requires_bun(&self, ctx: &GenerateContext) -> bool {
        if self.package_manager == PackageManager::Bun {
            return true;
        }
        if self
            .package_json
            .scripts
            .values()
            .any(|script| BUN_COMMAND.is_match(script))
        {
            return true;
        }
        ctx.config()
            .deploy
            .as_ref()
            .and_then(|deploy| deploy.start_cmd.as_deref())
            .is_some_and(|cmd| BUN_COMMAND.is_match(cmd))
    }

    fn should_prune(&self, ctx: &GenerateContext) -> bool {
        ctx.env().is_config_truthy("PRUNE_DEPS")
            || ctx
                .config()
                .node
                .as_ref()
                .and_then(|node| node.prune_deps)
                .unwrap_or(false)
    }

    fn node_env_vars(&self) -> Vec<(&'static str, &'static str)> {
        let mut vars = vec![
            ("CI", "true"),
            ("NODE_ENV", "production"),
            ("NPM_CONFIG_FUND", "false"),
            ("NPM_CONFIG_PRODUCTION", "false"),
            ("NPM_CONFIG_UPDATE_NOTIFIER", "false"),
        ];
        if self.package_manager == PackageManager::Yarn1 {
            vars.push(("YARN_PRODUCTION", "false"));
        }
        vars
    }

    fn apply_node_version_sources(&self, ctx: &mut GenerateContext, node: &crate::resolver::PackageRef) {
        if let Some(engine) = self.package_json.engines.get("node") {
            ctx.pin_tool(node, engine.clone(), "package.json > engines > node", VersionSource::Manifest);
        }

        if let Ok(nvmrc) = ctx.app().read_file(".nvmrc") {
            let version = nvmrc.trim().trim_start_matches('v').to_string();
            ctx.pin_tool(node, version, ".nvmrc", VersionSource::RepoFile);
        }

        if let Ok(version_file) = ctx.app().read_file(".node-version") {
            ctx.pin_tool(node, version_file.trim().to_string(), ".node-version", VersionSource::RepoFile);
        }

        if let Some(version) = ctx.config().node.as_ref().and_then(|node| node.version.clone()) {
            ctx.pin_tool(node, version, "node.version", VersionSource::ProviderConfig);
        }

        ctx.pin_tool_from_env(node, "NODE_VERSION");
    }

    fn install_mise_packages(&self, ctx: &mut GenerateContext) {
        let requires_node = self.requires_node();
        let requires_bun = self.requires_bun(ctx);

        if requires_node || (requires_bun && !ctx.config().packages.contains_key("node")) {
            let node = ctx.add_tool("node", DEFAULT_NODE_VERSION);
            self.apply_node_version_sources(ctx, &node);
            // Node 25+ links against libatomic.
            ctx.deploy.add_apt_packages(["libatomic1"]);
        }

        if requires_bun {
            let bun = ctx.add_tool("bun", DEFAULT_BUN_VERSION);
            if let Ok(version_file) = ctx.app().read_file(".bun-version") {
                ctx.pin_tool(&bun, version_file.trim().to_string(), ".bun-version", VersionSource::RepoFile);
            }
            if let Some(version) = ctx.config().node.as_ref().and_then(|node| node.bun_version.clone()) {
                ctx.pin_tool(&bun, version, "node.bunVersion", VersionSource::ProviderConfig);
            }
            ctx.pin_tool_from_env(&bun, "BUN_VERSION");
        }

        if self.uses_corepack() {
            ctx.mise()
                .variables
                .insert("MISE_NODE_COREPACK".to_string(), "true".to_string());
        } else {
            match self.package_manager {
                PackageManager::Pnpm => {
                    let pnpm = ctx.add_tool("pnpm", DEFAULT_PNPM_VERSION);
                    if let Some(engine) = self.package_json.engines.get("pnpm") {
                        ctx.pin_tool(&pnpm, engine.clone(), "package.json > engines > pnpm", VersionSource::Manifest);
                    }
                }
                PackageManager::Yarn1 => {
                    ctx.add_tool("yarn", "1");
                }
                PackageManager::YarnBerry => {
                    ctx.add_tool("yarn", "latest");
                }
                PackageManager::Npm | PackageManager::Bun => {}
            }
        }
    }

    fn install_node_deps(&self, ctx: &mut GenerateContext, install: &mut CommandStepBuilder) {
        install.add_variables(self.node_env_vars());
        install.use_secrets_with_prefixes(ctx.env(), ["NODE", "NPM", "BUN", "PNPM", "YARN", "CI"]);
        install.add_paths(["/app/node_modules/.bin"]);

        if ctx.app().has_match("node_modules") {
            tracing::warn!("node_modules directory found in project root, this is likely a mistake");
        }

        if self.uses_corepack() {
            install.add_variables([("COREPACK_HOME", COREPACK_HOME)]);
            install.add_command(Command::copy("package.json"));
            install.add_command(Command::exec(
                "npm i -g corepack@latest && corepack enable && corepack prepare --activate",
            ));
        }

        // The cache directory doubles as a cache key source, so it must
        // exist even for dependency-free manifests.
        install.add_command(Command::exec(format!("mkdir -p {NODE_MODULES_CACHE}")));

        let has_lifecycle_hooks = ["preinstall", "postinstall", "prepare"]
            .iter()
            .any(|script| self.package_json.has_script(script));
        if has_lifecycle_hooks {
            // Lifecycle scripts (patch-package and friends) may read any
            // file, so the whole tree is copied and all secrets exposed.
            install.add_command(Command::copy("."));
            install.secrets = vec!["*".to_string()];
        } else {
            for file in self.package_manager.supporting_install_files(ctx.app()) {
                install.add_command(Command::copy(file));
            }
        }

        install.add_cache(self.package_manager.install_cache(&mut ctx.caches));
        install.add_command(self.package_manager.install_command(ctx.app()));
    }

    fn add_build_caches(&self, ctx: &mut GenerateContext, build: &mut CommandStepBuilder) {
        build.add_cache(ctx.caches.add_cache("node-modules", NODE_MODULES_CACHE));

        let framework_caches: [(&str, &str, bool); 4] = [
            (
                "next",
                "/app/.next/cache",
                self.package_json
                    .script("build")
                    .is_some_and(|script| script.contains("next build")),
            ),
            ("remix", "/app/.cache", self.package_json.has_dependency("@remix-run/node")),
            ("vite", "/app/node_modules/.vite", self.package_json.has_dependency("vite")),
            ("astro", "/app/node_modules/.astro", self.package_json.has_dependency("astro")),
        ];
        for (name, dir, applies) in framework_caches {
            if applies {
                build.add_cache(ctx.caches.add_cache(name, dir));
            }
        }
    }

    fn start_command(&self, ctx: &GenerateContext) -> Option<String> {
        if self.package_json.has_script("start") {
            return Some(self.package_manager.run_cmd("start"));
        }
        if let Some(main) = &self.package_json.main {
            return Some(self.package_manager.run_script_command(main));
        }
        let files = ctx.app().find_files("{index.js,index.ts}");
        if let Some(file) = files.first() {
            return Some(self.package_manager.run_script_command(file));
        }
        if self.package_json.has_dependency("nuxt") {
            return Some("node .output/server/index.mjs".to_string());
        }
        None
    }
}

impl Provider for NodeProvider {
    fn name(&self) -> &'static str {
        "node"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(ctx.app().has_file("package.json"))
    }

    fn initialize(&mut self, ctx: &GenerateContext) -> KeelResult<()> {
        self.package_json = ctx.app().read_json("package.json")?;
        self.package_manager = PackageManager::detect(ctx.app(), &self.package_json);
        Ok(())
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        ctx.metadata.set("nodePackageManager", self.package_manager.binary());
        ctx.metadata.set_bool("nodeUsesCorepack", self.uses_corepack());

        self.install_mise_packages(ctx);
        let mise_layer = ctx.mise_layer();

        let mut install = ctx.new_command_step("install");
        install.add_input(Layer::step(crate::generate::MISE_STEP_NAME));
        self.install_node_deps(ctx, &mut install);
        let install_name = ctx.add_step(install);

        let should_prune = self.should_prune(ctx);
        let mut prune_name = None;
        if should_prune {
            if let Some(prune_cmd) = self.package_manager.prune_command() {
                let mut prune = ctx.new_command_step("prune");
                prune.add_input(Layer::step(install_name.clone()));
                prune.secrets = Vec::new();
                prune.add_variables([("NPM_CONFIG_PRODUCTION", "true")]);
                prune.add_command(prune_cmd);
                prune_name = Some(ctx.add_step(prune));
            }
        }

        let mut build = ctx.new_command_step("build");
        build.add_input(Layer::step(install_name.clone()));
        build.add_input(ctx.local_layer());
        if self.package_json.has_script("build") {
            build.add_command(Command::exec(self.package_manager.run_cmd("build")));
            if self.package_json.has_dependency("next") {
                build.add_variables([("NEXT_TELEMETRY_DISABLED", "1")]);
            }
        }
        self.add_build_caches(ctx, &mut build);
        let build_name = ctx.add_step(build);

        if ctx.deploy.start_cmd.is_none() {
            ctx.deploy.start_cmd = self.start_command(ctx);
        }
        ctx.deploy.add_variables(self.node_env_vars());

        if self.package_json.has_dependency("puppeteer") {
            tracing::info!("installing puppeteer dependencies");
            ctx.deploy.add_apt_packages([
                "ca-certificates",
                "fonts-liberation",
                "libasound2",
                "libatk1.0-0",
                "libcairo2",
                "libcups2",
                "libgbm1",
                "libgtk-3-0",
                "libnss3",
                "libpango-1.0-0",
                "libx11-6",
                "libxcomposite1",
                "libxdamage1",
                "libxext6",
                "libxfixes3",
                "libxrandr2",
                "xdg-utils",
            ]);
        }

        let modules_source = prune_name.unwrap_or_else(|| build_name.clone());
        let node_modules_layer = Layer::step_filtered(
            modules_source,
            Filter::includes(self.package_manager.install_folders()),
        );

        let mut build_includes = vec!["/root/.cache".to_string(), ".".to_string()];
        if self.uses_corepack() {
            build_includes.push(COREPACK_HOME.to_string());
        }
        let build_layer = Layer::step_filtered(
            build_name,
            Filter {
                include: build_includes,
                exclude: vec!["node_modules".to_string(), ".yarn".to_string()],
            },
        );

        ctx.deploy
            .add_inputs([mise_layer, node_modules_layer, build_layer]);

        Ok(())
    }

    fn start_command_help(&self) -> &'static str {
        "To configure your start command, Keel will check:\n\n\
         1. A \"start\" script in your package.json:\n\
            \"scripts\": {\n\
              \"start\": \"node index.js\"\n\
            }\n\n\
         2. A \"main\" field in your package.json pointing to your entry file:\n\
            \"main\": \"src/server.js\"\n\n\
         3. An index.js or index.ts file in your project root\n\n\
         If you have a static site, set the KEEL_STATIC_FILE_ROOT environment\n\
         variable to the directory of your built static files."
    }
}
