//! Python provider.

use keel_common::KeelResult;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::generate::{CommandStepBuilder, GenerateContext};
use crate::plan::{Command, Filter, Layer};
use crate::resolver::VersionSource;

use super::Provider;

const DEFAULT_PYTHON_VERSION: &str = "3.13";
const UV_CACHE_DIR: &str = "/opt/uv-cache";
const PIP_CACHE_DIR: &str = "/root/.cache/pip";

static PIPFILE_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:python_version|python_full_version)\s*=\s*['"]([0-9.]+)['"]"#)
        .expect("pipfile version regex")
});

/// Apt packages required by well-known native Python dependencies.
const PYTHON_DEP_REQUIREMENTS: [(&str, &[&str]); 4] = [
    ("cairo", &["libcairo2-dev"]),
    ("pdf2image", &["poppler-utils"]),
    ("pydub", &["ffmpeg"]),
    ("psycopg2", &["libpq-dev"]),
];

/// Which dependency manager the project uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PythonPackageManager {
    Pip,
    Poetry,
    Pdm,
    Uv,
    Pipenv,
}

impl PythonPackageManager {
    fn name(self) -> &'static str {
        match self {
            PythonPackageManager::Pip => "pip",
            PythonPackageManager::Poetry => "poetry",
            PythonPackageManager::Pdm => "pdm",
            PythonPackageManager::Uv => "uv",
            PythonPackageManager::Pipenv => "pipenv",
        }
    }
}

/// Detects Python projects across pip, poetry, pdm, uv and pipenv flows.
#[derive(Debug, Default)]
pub struct PythonProvider;

impl PythonProvider {
    fn has_requirements(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("requirements.txt")
    }

    fn has_pyproject(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("pyproject.toml")
    }

    fn has_pipfile(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("Pipfile")
    }

    fn has_poetry(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("poetry.lock")
    }

    fn has_pdm(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("pdm.lock")
    }

    fn has_uv(ctx: &GenerateContext) -> bool {
        ctx.app().has_file("uv.lock")
    }

    fn package_manager(ctx: &GenerateContext) -> PythonPackageManager {
        if Self::has_pyproject(ctx) && Self::has_poetry(ctx) {
            PythonPackageManager::Poetry
        } else if Self::has_pyproject(ctx) && Self::has_pdm(ctx) {
            PythonPackageManager::Pdm
        } else if Self::has_pyproject(ctx) && Self::has_uv(ctx) {
            PythonPackageManager::Uv
        } else if Self::has_pipfile(ctx) {
            PythonPackageManager::Pipenv
        } else {
            PythonPackageManager::Pip
        }
    }

    fn uses_dep(ctx: &GenerateContext, dep: &str) -> bool {
        ["requirements.txt", "pyproject.toml", "Pipfile"]
            .iter()
            .any(|file| {
                ctx.app()
                    .read_file(file)
                    .map(|contents| contents.to_lowercase().contains(&dep.to_lowercase()))
                    .unwrap_or(false)
            })
    }

    fn resolve_python_version(&self, ctx: &mut GenerateContext) {
        let python = ctx.add_tool("python", DEFAULT_PYTHON_VERSION);

        if let Ok(version_file) = ctx.app().read_file(".python-version") {
            ctx.pin_tool(&python, version_file.trim().to_string(), ".python-version", VersionSource::RepoFile);
        }

        if let Ok(runtime_file) = ctx.app().read_file("runtime.txt") {
            let version = runtime_file.trim().trim_start_matches("python-").to_string();
            ctx.pin_tool(&python, version, "runtime.txt", VersionSource::RepoFile);
        }

        if let Ok(pipfile) = ctx.app().read_file("Pipfile") {
            if let Some(captures) = PIPFILE_VERSION.captures(&pipfile) {
                ctx.pin_tool(&python, &captures[1], "Pipfile", VersionSource::Manifest);
            }
        }

        if let Some(version) = ctx.config().python.as_ref().and_then(|python| python.version.clone()) {
            ctx.pin_tool(&python, version, "python.version", VersionSource::ProviderConfig);
        }

        ctx.pin_tool_from_env(&python, "PYTHON_VERSION");
    }

    fn install_commands(
        manager: PythonPackageManager,
        ctx: &GenerateContext,
        install: &mut CommandStepBuilder,
    ) {
        match manager {
            PythonPackageManager::Pip => {
                if Self::has_requirements(ctx) {
                    install.add_commands([
                        Command::copy("requirements.txt"),
                        Command::exec("pip install -r requirements.txt"),
                    ]);
                } else if Self::has_pyproject(ctx) {
                    install.add_commands([
                        Command::copy("pyproject.toml"),
                        Command::copy("."),
                        Command::exec("pip install ."),
                    ]);
                }
            }
            PythonPackageManager::Poetry => {
                install.add_commands([
                    Command::exec("pipx install poetry"),
                    Command::exec("poetry config virtualenvs.create false"),
                    Command::copy("pyproject.toml"),
                    Command::copy("poetry.lock"),
                    Command::exec("poetry install --no-interaction --no-ansi --no-root"),
                ]);
            }
            PythonPackageManager::Pdm => {
                install.add_variables([("PDM_CHECK_UPDATE", "false")]);
                install.add_commands([
                    Command::exec("pipx install pdm"),
                    Command::copy("pyproject.toml"),
                    Command::copy("pdm.lock"),
                    Command::copy("."),
                    Command::exec("pdm install --check --prod --no-editable"),
                    Command::path("/app/.venv/bin"),
                ]);
            }
            PythonPackageManager::Uv => {
                install.add_variables([
                    ("UV_COMPILE_BYTECODE", "1"),
                    ("UV_LINK_MODE", "copy"),
                    ("UV_CACHE_DIR", UV_CACHE_DIR),
                ]);
                install.add_commands([
                    Command::exec("pipx install uv"),
                    Command::copy("pyproject.toml"),
                    Command::copy("uv.lock"),
                    Command::exec(
                        "uv sync --frozen --no-install-project --no-install-workspace --no-dev",
                    ),
                    Command::copy("."),
                    Command::exec("uv sync --frozen --no-dev"),
                    Command::path("/app/.venv/bin"),
                ]);
            }
            PythonPackageManager::Pipenv => {
                install.add_command(Command::copy("Pipfile"));
                if ctx.app().has_file("Pipfile.lock") {
                    install.add_commands([
                        Command::copy("Pipfile.lock"),
                        Command::exec("pipenv install --deploy"),
                    ]);
                } else {
                    install.add_command(Command::exec("pipenv install --skip-lock"));
                }
            }
        }
    }
}

impl Provider for PythonProvider {
    fn name(&self) -> &'static str {
        "python"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(ctx.app().has_match("main.py")
            || Self::has_requirements(ctx)
            || Self::has_pyproject(ctx)
            || Self::has_pipfile(ctx))
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        self.resolve_python_version(ctx);

        let manager = Self::package_manager(ctx);
        if !matches!(manager, PythonPackageManager::Pip | PythonPackageManager::Pipenv) {
            ctx.add_tool("pipx", "latest");
        } else if matches!(manager, PythonPackageManager::Pipenv) {
            ctx.add_tool("pipenv", "latest");
        }

        ctx.metadata.set("pythonPackageManager", manager.name());

        // Build headers for common native wheels.
        let mut apt_packages = vec!["gcc".to_string(), "pkg-config".to_string()];
        for (dep, packages) in PYTHON_DEP_REQUIREMENTS {
            if Self::uses_dep(ctx, dep) {
                apt_packages.extend(packages.iter().map(ToString::to_string));
            }
        }
        let apt_name = ctx.add_apt_step("python", apt_packages);

        let mise_layer = ctx.mise_layer();
        let mut install = ctx.new_command_step("install");
        install.add_input(Layer::step(crate::generate::MISE_STEP_NAME));
        install.depends_on.push(apt_name);
        install.add_paths(["/root/.local/bin"]);
        install.add_variables([
            ("PIP_DEFAULT_TIMEOUT", "100"),
            ("PIP_DISABLE_PIP_VERSION_CHECK", "1"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONFAULTHANDLER", "1"),
            ("PYTHONHASHSEED", "random"),
            ("PYTHONUNBUFFERED", "1"),
        ]);
        install.add_cache(ctx.caches.add_cache("pip", PIP_CACHE_DIR));
        if matches!(manager, PythonPackageManager::Uv) {
            install.add_cache(ctx.caches.add_cache("uv", UV_CACHE_DIR));
        }
        Self::install_commands(manager, ctx, &mut install);
        let install_name = ctx.add_step(install);

        let mut build = ctx.new_command_step("build");
        build.add_input(Layer::step(install_name));
        build.add_input(ctx.local_layer());
        build.add_command(Command::copy("."));
        let build_name = ctx.add_step(build);

        if ctx.deploy.start_cmd.is_none() && ctx.app().has_match("main.py") {
            ctx.deploy.start_cmd = Some("python main.py".to_string());
        }
        ctx.deploy.add_variables([
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONUNBUFFERED", "1"),
        ]);
        ctx.deploy.add_inputs([
            mise_layer,
            Layer::step_filtered(build_name, Filter::includes(["."])),
        ]);

        Ok(())
    }

    fn start_command_help(&self) -> &'static str {
        "Keel starts Python apps with `python main.py` when a main.py exists \
         in the project root.\n\nFor anything else, set the start command in \
         keel.json:\n  {\"deploy\": {\"startCommand\": \"uvicorn app:app\"}}"
    }
}
