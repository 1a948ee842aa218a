//! Shell-script provider: runs a start script atop the runtime image.

use keel_common::KeelResult;

use crate::generate::GenerateContext;
use crate::plan::{Command, KEEL_RUNTIME_IMAGE, Layer};

use super::Provider;

const START_SCRIPT_NAME: &str = "start.sh";

/// Runs a repository shell script as the container entry point.
#[derive(Debug, Default)]
pub struct ShellProvider {
    script_name: String,
}

impl ShellProvider {
    fn script(ctx: &GenerateContext) -> Option<String> {
        if let Some((script, key)) = ctx.env().get_config_variable("SHELL_SCRIPT") {
            if ctx.app().has_match(&script) {
                return Some(script);
            }
            tracing::warn!(script = %script, source = %key, "configured shell script not found");
        }
        if let Some(script) = ctx
            .config()
            .shell
            .as_ref()
            .and_then(|config| config.script.clone())
        {
            if ctx.app().has_match(&script) {
                return Some(script);
            }
        }
        if ctx.app().has_match(START_SCRIPT_NAME) {
            return Some(START_SCRIPT_NAME.to_string());
        }
        None
    }
}

impl Provider for ShellProvider {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(Self::script(ctx).is_some())
    }

    fn initialize(&mut self, ctx: &GenerateContext) -> KeelResult<()> {
        self.script_name = Self::script(ctx).unwrap_or_else(|| START_SCRIPT_NAME.to_string());
        Ok(())
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        tracing::info!(script = %self.script_name, "using shell script");
        ctx.metadata.set("shellScript", &self.script_name);

        let mut setup = ctx.new_command_step("setup");
        setup.add_input(Layer::image(KEEL_RUNTIME_IMAGE));
        setup.add_commands([
            Command::copy("."),
            Command::exec(format!("chmod +x {}", self.script_name)),
        ]);
        let setup_name = ctx.add_step(setup);

        ctx.deploy.base = Some(Layer::step(setup_name));
        // Tools pinned via config still need to reach the runtime image.
        if ctx.get_step(crate::generate::MISE_STEP_NAME).is_some() {
            let mise_layer = ctx.mise_layer();
            ctx.deploy.add_inputs([mise_layer]);
        }
        ctx.deploy.start_cmd = Some(format!("sh {}", self.script_name));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, Environment};
    use crate::config::Config;
    use keel_common::KeelPaths;

    fn context(files: &[(&str, &str)], env: &[&str]) -> (tempfile::TempDir, GenerateContext) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let app = App::new(dir.path()).unwrap();
        let env = Environment::from_pairs(env.iter().copied()).unwrap();
        let ctx = GenerateContext::with_paths(
            app,
            env,
            Config::default(),
            KeelPaths::with_root(dir.path().join(".keel-cache")),
        )
        .unwrap();
        (dir, ctx)
    }

    #[test]
    fn detects_start_sh() {
        let (_dir, ctx) = context(&[("start.sh", "#!/bin/sh\n")], &[]);
        assert!(ShellProvider::default().detect(&ctx).unwrap());

        let (_dir, ctx) = context(&[], &[]);
        assert!(!ShellProvider::default().detect(&ctx).unwrap());
    }

    #[test]
    fn env_knob_selects_script() {
        let (_dir, ctx) = context(&[("run.sh", "#!/bin/sh\n")], &["KEEL_SHELL_SCRIPT=run.sh"]);
        assert_eq!(ShellProvider::script(&ctx).as_deref(), Some("run.sh"));
    }

    #[test]
    fn missing_configured_script_falls_back() {
        let (_dir, ctx) = context(
            &[("start.sh", "#!/bin/sh\n")],
            &["KEEL_SHELL_SCRIPT=missing.sh"],
        );
        assert_eq!(ShellProvider::script(&ctx).as_deref(), Some("start.sh"));
    }

    #[test]
    fn plan_builds_setup_step_as_deploy_base() {
        let (_dir, mut ctx) = context(&[("start.sh", "#!/bin/sh\n")], &[]);
        let mut provider = ShellProvider::default();
        provider.initialize(&ctx).unwrap();
        provider.plan(&mut ctx).unwrap();

        assert_eq!(ctx.deploy.base, Some(Layer::step("setup")));
        assert_eq!(ctx.deploy.start_cmd.as_deref(), Some("sh start.sh"));

        let setup = ctx.get_command_step_mut("setup").unwrap();
        assert!(setup.commands.contains(&Command::exec("chmod +x start.sh")));
    }
}
