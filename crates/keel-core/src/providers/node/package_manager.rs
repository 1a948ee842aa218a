//! Node package manager detection and per-manager command shapes.

use crate::app::App;
use crate::generate::CacheContext;
use crate::plan::{CacheType, Command};

use super::package_json::PackageJson;

/// The package manager driving installs for a Node app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageManager {
    /// npm (the fallback).
    #[default]
    Npm,
    /// pnpm.
    Pnpm,
    /// Bun.
    Bun,
    /// Yarn 1 (classic).
    Yarn1,
    /// Yarn 2+ ("berry").
    YarnBerry,
}

/// Yarn major versions 2-4 are all part of the "berry" release line and are
/// installed differently from classic yarn.
fn parse_yarn_line(version: &str) -> PackageManager {
    if version.split('.').next() == Some("1") {
        PackageManager::Yarn1
    } else {
        PackageManager::YarnBerry
    }
}

impl PackageManager {
    /// Detect the package manager: the `packageManager` field first, then
    /// lockfiles, then engine constraints, defaulting to npm.
    #[must_use]
    pub fn detect(app: &App, package_json: &PackageJson) -> Self {
        if let Some((name, version)) = package_json.package_manager_info() {
            match name {
                "yarn" if !version.is_empty() => return parse_yarn_line(version),
                "yarn" => return PackageManager::YarnBerry,
                "pnpm" => return PackageManager::Pnpm,
                "npm" => return PackageManager::Npm,
                "bun" => return PackageManager::Bun,
                "" => tracing::info!("package manager name is empty in package.json"),
                other => {
                    tracing::warn!(
                        package_manager = %other,
                        "unknown package manager in package.json, defaulting to npm"
                    );
                }
            }
        }

        if app.has_file("pnpm-lock.yaml") {
            return PackageManager::Pnpm;
        }
        if app.has_file("bun.lockb") || app.has_file("bun.lock") {
            return PackageManager::Bun;
        }
        if app.has_file(".yarnrc.yml") || app.has_file(".yarnrc.yaml") {
            return PackageManager::YarnBerry;
        }
        if app.has_file("yarn.lock") {
            return PackageManager::Yarn1;
        }

        if !package_json.engines.is_empty() {
            if package_json.engines.contains_key("pnpm") {
                return PackageManager::Pnpm;
            }
            if package_json.engines.contains_key("bun") {
                return PackageManager::Bun;
            }
            if let Some(engine) = package_json.engines.get("yarn") {
                return parse_yarn_line(engine.trim());
            }
        }

        tracing::info!("no package manager inferred, using npm default");
        PackageManager::Npm
    }

    /// The executable name.
    #[must_use]
    pub fn binary(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Bun => "bun",
            PackageManager::Yarn1 | PackageManager::YarnBerry => "yarn",
        }
    }

    /// `<pm> run <script>`.
    #[must_use]
    pub fn run_cmd(self, script: &str) -> String {
        format!("{} run {script}", self.binary())
    }

    /// How an entry file is executed at runtime.
    #[must_use]
    pub fn run_script_command(self, file: &str) -> String {
        if self == PackageManager::Bun {
            format!("bun {file}")
        } else {
            format!("node {file}")
        }
    }

    /// Files copied into the install step when no lifecycle scripts force a
    /// full source copy.
    #[must_use]
    pub fn supporting_install_files(self, app: &App) -> Vec<String> {
        let candidates = [
            "package.json",
            "package-lock.json",
            "pnpm-lock.yaml",
            "pnpm-workspace.yaml",
            "bun.lockb",
            "bun.lock",
            "yarn.lock",
            ".yarnrc.yml",
            ".yarnrc.yaml",
            ".npmrc",
            ".node-version",
            ".nvmrc",
        ];
        candidates
            .iter()
            .filter(|file| app.has_file(file))
            .map(ToString::to_string)
            .collect()
    }

    /// Register and return this manager's download cache.
    pub fn install_cache(self, caches: &mut CacheContext) -> String {
        match self {
            PackageManager::Npm => caches.add_cache("npm-install", "/root/.npm"),
            PackageManager::Pnpm => {
                caches.add_cache("pnpm-install", "/root/.local/share/pnpm/store/v3")
            }
            PackageManager::Bun => caches.add_cache("bun-install", "/root/.bun/install/cache"),
            PackageManager::Yarn1 => caches.add_cache_with_type(
                "yarn-install",
                "/usr/local/share/.cache/yarn",
                CacheType::Locked,
            ),
            PackageManager::YarnBerry => caches.add_cache("yarn-install", "/app/.yarn/cache"),
        }
    }

    /// The dependency install command, lockfile-aware.
    #[must_use]
    pub fn install_command(self, app: &App) -> Command {
        let cmd = match self {
            PackageManager::Npm => {
                if app.has_file("package-lock.json") {
                    "npm ci"
                } else {
                    "npm install"
                }
            }
            PackageManager::Pnpm => {
                if app.has_file("pnpm-lock.yaml") {
                    "pnpm install --frozen-lockfile --prefer-offline"
                } else {
                    "pnpm install"
                }
            }
            PackageManager::Bun => "bun install --frozen-lockfile",
            PackageManager::Yarn1 => "yarn install --frozen-lockfile",
            PackageManager::YarnBerry => "yarn install --immutable",
        };
        Command::exec(cmd)
    }

    /// The production prune command, when the manager has one.
    #[must_use]
    pub fn prune_command(self) -> Option<Command> {
        let cmd = match self {
            PackageManager::Npm => "npm prune --omit=dev",
            PackageManager::Pnpm => "pnpm prune --prod",
            PackageManager::Yarn1 => "yarn install --production --ignore-scripts --prefer-offline",
            // Berry and bun have no safe in-place prune.
            PackageManager::YarnBerry | PackageManager::Bun => return None,
        };
        Some(Command::exec(cmd))
    }

    /// Directories carrying installed dependencies into the runtime image.
    #[must_use]
    pub fn install_folders(self) -> Vec<String> {
        match self {
            PackageManager::YarnBerry => {
                vec!["/app/node_modules".to_string(), "/app/.yarn".to_string()]
            }
            _ => vec!["/app/node_modules".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;

    fn app_with(files: &[(&str, &str)]) -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let app = App::new(dir.path()).unwrap();
        (dir, app)
    }

    #[test]
    fn package_manager_field_wins_over_lockfiles() {
        let (_dir, app) = app_with(&[("pnpm-lock.yaml", "")]);
        let manifest = PackageJson {
            package_manager: Some("yarn@4.0.1".to_string()),
            ..PackageJson::default()
        };
        assert_eq!(PackageManager::detect(&app, &manifest), PackageManager::YarnBerry);
    }

    #[test]
    fn yarn_one_from_version_line() {
        let (_dir, app) = app_with(&[]);
        let manifest = PackageJson {
            package_manager: Some("yarn@1.22.19".to_string()),
            ..PackageJson::default()
        };
        assert_eq!(PackageManager::detect(&app, &manifest), PackageManager::Yarn1);
    }

    #[test]
    fn lockfile_detection() {
        let (_dir, app) = app_with(&[("bun.lockb", "")]);
        assert_eq!(
            PackageManager::detect(&app, &PackageJson::default()),
            PackageManager::Bun
        );

        let (_dir, app) = app_with(&[("yarn.lock", "")]);
        assert_eq!(
            PackageManager::detect(&app, &PackageJson::default()),
            PackageManager::Yarn1
        );
    }

    #[test]
    fn engines_are_a_last_resort() {
        let (_dir, app) = app_with(&[]);
        let manifest = PackageJson {
            engines: [("pnpm".to_string(), ">=9".to_string())].into_iter().collect(),
            ..PackageJson::default()
        };
        assert_eq!(PackageManager::detect(&app, &manifest), PackageManager::Pnpm);
    }

    #[test]
    fn npm_install_without_lockfile() {
        let (_dir, app) = app_with(&[]);
        assert_eq!(
            PackageManager::Npm.install_command(&app),
            Command::exec("npm install")
        );

        let (_dir, app) = app_with(&[("package-lock.json", "{}")]);
        assert_eq!(
            PackageManager::Npm.install_command(&app),
            Command::exec("npm ci")
        );
    }

    #[test]
    fn run_script_command_uses_runtime() {
        assert_eq!(PackageManager::Bun.run_script_command("index.ts"), "bun index.ts");
        assert_eq!(PackageManager::Npm.run_script_command("index.js"), "node index.js");
    }
}
