//! Static-site provider: serves files over HTTP with caddy.
//!
//! Distinct from any SPA handling in the node provider; this simply serves
//! a directory.

use serde::Deserialize;

use keel_common::KeelResult;

use crate::generate::GenerateContext;
use crate::plan::{Command, Filter, Layer};

use super::Provider;

const STATICFILE_CONFIG_NAME: &str = "Staticfile";
const CADDYFILE_PATH: &str = "Caddyfile";

const CADDYFILE_TEMPLATE: &str = r"{
	admin off
	persist_config off
	auto_https off
}

:{$PORT:80} {
	log {
		format json
	}

	root * /app/{{STATIC_FILE_ROOT}}
	encode gzip
	file_server
	try_files {path} /index.html
}
";

#[derive(Debug, Default, Deserialize)]
struct StaticfileYaml {
    #[serde(default)]
    root: Option<String>,
}

/// Serves a directory of static files with caddy.
#[derive(Debug, Default)]
pub struct StaticfileProvider {
    root_dir: String,
}

impl StaticfileProvider {
    fn root_dir(ctx: &GenerateContext) -> Option<String> {
        if let Some((root, _)) = ctx.env().get_config_variable("STATIC_FILE_ROOT") {
            return Some(root);
        }
        if let Some(root) = ctx
            .config()
            .staticfile
            .as_ref()
            .and_then(|config| config.root.clone())
        {
            return Some(root);
        }
        if ctx.app().has_file(STATICFILE_CONFIG_NAME) {
            if let Ok(file) = ctx.app().read_yaml::<StaticfileYaml>(STATICFILE_CONFIG_NAME) {
                if let Some(root) = file.root {
                    return Some(root);
                }
            }
        }
        if ctx.app().has_match("public") {
            return Some("public".to_string());
        }
        if ctx.app().has_file("index.html") {
            return Some(".".to_string());
        }
        None
    }

    fn caddyfile(&self, ctx: &GenerateContext) -> String {
        // A Caddyfile checked into the repo wins over the template.
        if let Ok(custom) = ctx.app().read_file(CADDYFILE_PATH) {
            tracing::info!("using custom Caddyfile from the repository");
            return custom;
        }
        CADDYFILE_TEMPLATE.replace("{{STATIC_FILE_ROOT}}", &self.root_dir)
    }
}

impl Provider for StaticfileProvider {
    fn name(&self) -> &'static str {
        "staticfile"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(Self::root_dir(ctx).is_some())
    }

    fn initialize(&mut self, ctx: &GenerateContext) -> KeelResult<()> {
        self.root_dir = Self::root_dir(ctx).unwrap_or_else(|| ".".to_string());
        Ok(())
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        tracing::info!(root = %self.root_dir, "serving static files");
        ctx.metadata.set("staticfileRoot", &self.root_dir);
        ctx.add_tool("caddy", "latest");

        let mise_layer = ctx.mise_layer();
        let caddyfile = self.caddyfile(ctx);

        let mut build = ctx.new_command_step("build");
        build.add_input(Layer::step(crate::generate::MISE_STEP_NAME));
        build.add_input(ctx.local_layer());
        build.assets.insert("Caddyfile".to_string(), caddyfile);
        build.add_commands([
            Command::file("Caddyfile", CADDYFILE_PATH),
            Command::exec("caddy fmt --overwrite Caddyfile"),
        ]);
        let build_name = ctx.add_step(build);

        ctx.deploy.add_inputs([
            mise_layer,
            Layer::step_filtered(build_name, Filter::includes(["."])),
        ]);
        ctx.deploy.start_cmd = Some(format!(
            "caddy run --config {CADDYFILE_PATH} --adapter caddyfile 2>&1"
        ));

        Ok(())
    }
}
