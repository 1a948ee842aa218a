//! Tool-version negotiation.
//!
//! Providers declare which tools they need and may pin versions from
//! increasingly authoritative sources. Resolution fans out to the external
//! [`VersionOracle`] in parallel, one in-flight request per tool, with a
//! filesystem lock so concurrent invocations sharing the on-disk tool cache
//! serialize on the same tool. Dropping the `resolve_all` future cancels any
//! in-flight oracle call.

pub mod oracle;

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::sync::Arc;

use dashmap::DashMap;
use fs3::FileExt;
use futures::future;
use keel_common::{KeelError, KeelPaths, KeelResult};
use once_cell::sync::Lazy;
use regex::Regex;

pub use oracle::{PassthroughOracle, StaticVersionOracle, VersionOracle};

/// Where a version request came from, in increasing priority.
///
/// A later `version()` call replaces the current pin only when its source
/// priority is at least as high; ties take the later call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionSource {
    /// Built-in fallback supplied with `default()`.
    BuiltinDefault,
    /// Inferred by a provider from the project shape.
    Provider,
    /// Parsed from a version file in the repository (`.nvmrc`, ...).
    RepoFile,
    /// A package-manifest field (`engines.node`, `rust-version`, ...).
    Manifest,
    /// A provider block in the user config file.
    ProviderConfig,
    /// An environment variable.
    EnvVar,
}

/// Handle to a declared tool, returned by [`Resolver::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    name: String,
}

impl PackageRef {
    /// The tool name this reference points at.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A recorded version request for a single tool.
#[derive(Debug, Clone)]
pub struct RequestedVersion {
    /// The requested version or constraint.
    pub version: String,
    /// Display label of the winning source (e.g. `.nvmrc`).
    pub source_label: String,
    /// Priority class of the winning source.
    pub source: VersionSource,
}

/// The outcome of resolving one tool.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPackage {
    /// Tool name.
    pub name: String,
    /// The version that was requested.
    pub requested_version: String,
    /// The concrete version the oracle chose.
    pub resolved_version: String,
    /// Where the request came from.
    pub source: String,
}

#[derive(Debug, Clone)]
struct Request {
    default_version: String,
    pin: Option<RequestedVersion>,
}

impl Request {
    fn effective(&self) -> RequestedVersion {
        self.pin.clone().unwrap_or_else(|| RequestedVersion {
            version: self.default_version.clone(),
            source_label: "default".to_string(),
            source: VersionSource::BuiltinDefault,
        })
    }
}

/// Records tool-version requests and resolves them against an oracle.
pub struct Resolver {
    paths: KeelPaths,
    requests: BTreeMap<String, Request>,
    tool_mutexes: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Resolver {
    /// Create a resolver whose file locks live under the given cache root.
    #[must_use]
    pub fn new(paths: KeelPaths) -> Self {
        Self {
            paths,
            requests: BTreeMap::new(),
            tool_mutexes: Arc::new(DashMap::new()),
        }
    }

    /// Declare that a tool is needed, with a fallback version used when no
    /// pin is recorded. Declaring the same tool again returns the existing
    /// reference without touching an existing pin.
    pub fn default(&mut self, tool: impl Into<String>, fallback_version: impl Into<String>) -> PackageRef {
        let name = tool.into();
        self.requests.entry(name.clone()).or_insert_with(|| Request {
            default_version: fallback_version.into(),
            pin: None,
        });
        PackageRef { name }
    }

    /// Record a pin attempt from the given source. The pin wins when its
    /// priority is at least the current pin's priority.
    pub fn version(
        &mut self,
        package: &PackageRef,
        requested_version: impl Into<String>,
        source_label: impl Into<String>,
        source: VersionSource,
    ) {
        let version = requested_version.into();
        let version = version.trim().to_string();
        if version.is_empty() {
            return;
        }

        let Some(request) = self.requests.get_mut(&package.name) else {
            tracing::warn!(tool = %package.name, "version pin for undeclared tool ignored");
            return;
        };

        let replace = request.pin.as_ref().is_none_or(|pin| source >= pin.source);
        if replace {
            request.pin = Some(RequestedVersion {
                version,
                source_label: source_label.into(),
                source,
            });
        }
    }

    /// The current request for a tool, if declared.
    #[must_use]
    pub fn get(&self, tool: &str) -> Option<RequestedVersion> {
        self.requests.get(tool).map(Request::effective)
    }

    /// Names of all declared tools.
    #[must_use]
    pub fn tools(&self) -> Vec<String> {
        self.requests.keys().cloned().collect()
    }

    /// Resolve every declared tool to a concrete version.
    ///
    /// Tools resolve in parallel; a per-tool mutex plus an on-disk lock file
    /// ensure the same tool is never resolved concurrently, even across
    /// processes sharing the tool cache.
    ///
    /// # Errors
    ///
    /// Fails with [`KeelError::VersionResolution`] (or
    /// [`KeelError::UnknownTool`]) for the first tool that cannot be
    /// resolved.
    pub async fn resolve_all(
        &self,
        oracle: &dyn VersionOracle,
    ) -> KeelResult<BTreeMap<String, ResolvedPackage>> {
        if let Err(e) = self.paths.create_dirs() {
            tracing::debug!(error = %e, "tool cache directories unavailable, continuing without file locks");
        }

        let futures: Vec<_> = self
            .requests
            .iter()
            .map(|(tool, request)| self.resolve_one(oracle, tool.clone(), request.effective()))
            .collect();

        let mut resolved = BTreeMap::new();
        for result in future::join_all(futures).await {
            let package = result?;
            resolved.insert(package.name.clone(), package);
        }
        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        oracle: &dyn VersionOracle,
        tool: String,
        request: RequestedVersion,
    ) -> KeelResult<ResolvedPackage> {
        let mutex = self
            .tool_mutexes
            .entry(tool.replace('/', "-"))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = mutex.lock().await;
        let _file_lock = self.acquire_tool_lock(&tool).await;

        let constraint = extract_semver_token(&request.version);
        let mut resolved = oracle.latest_matching(&tool, &constraint).await;

        // Permissive fallback for non-semver version tokens.
        if matches!(resolved, Ok(None) | Err(_)) && constraint != request.version {
            if let Err(KeelError::UnknownTool { .. }) = resolved {
                // No point retrying a tool the service has never heard of.
            } else {
                resolved = oracle.latest_matching(&tool, &request.version).await;
            }
        }

        let resolved_version = match resolved {
            Ok(Some(version)) => version,
            Ok(None) => {
                return Err(KeelError::VersionResolution {
                    tool: tool.clone(),
                    constraint: request.version.clone(),
                    cause: "no version matched the constraint".to_string(),
                });
            }
            Err(err @ KeelError::UnknownTool { .. }) => return Err(err),
            Err(err) => {
                return Err(KeelError::VersionResolution {
                    tool: tool.clone(),
                    constraint: request.version.clone(),
                    cause: err.to_string(),
                });
            }
        };

        tracing::debug!(
            tool = %tool,
            requested = %request.version,
            resolved = %resolved_version,
            source = %request.source_label,
            "resolved tool version"
        );

        Ok(ResolvedPackage {
            name: tool,
            requested_version: request.version,
            resolved_version,
            source: request.source_label,
        })
    }

    /// Take the on-disk lock for a tool. Returns `None` (and proceeds
    /// unlocked) when the lock directory is unavailable.
    async fn acquire_tool_lock(&self, tool: &str) -> Option<ToolLockGuard> {
        let path = self.paths.tool_lock(tool);
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .ok()?;
            file.lock_exclusive().ok()?;
            Some(ToolLockGuard { file })
        })
        .await
        .ok()
        .flatten()
    }
}

struct ToolLockGuard {
    file: std::fs::File,
}

impl Drop for ToolLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(error = %e, "failed to release tool lock");
        }
    }
}

static SEMVER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(\.\d+){0,2}").expect("semver token regex"));

/// Extract the semver-looking token from a version string: `v18.20` becomes
/// `18.20`, `>=1.2` becomes `1.2`. Strings with no digits pass through.
#[must_use]
pub fn extract_semver_token(version: &str) -> String {
    SEMVER_TOKEN
        .find(version.trim())
        .map_or_else(|| version.trim().to_string(), |m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_resolver() -> (tempfile::TempDir, Resolver) {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(KeelPaths::with_root(tmp.path()));
        (tmp, resolver)
    }

    fn node_oracle() -> StaticVersionOracle {
        StaticVersionOracle::new().with_versions("node", ["18.20.5", "20.11.0", "22.9.0"])
    }

    #[test]
    fn higher_priority_wins_regardless_of_order() {
        let (_tmp, mut a) = test_resolver();
        let node = a.default("node", "22");
        a.version(&node, "18", ".nvmrc", VersionSource::RepoFile);
        a.version(&node, "20", "KEEL_NODE_VERSION", VersionSource::EnvVar);

        let (_tmp2, mut b) = test_resolver();
        let node = b.default("node", "22");
        b.version(&node, "20", "KEEL_NODE_VERSION", VersionSource::EnvVar);
        b.version(&node, "18", ".nvmrc", VersionSource::RepoFile);

        for resolver in [&a, &b] {
            let request = resolver.get("node").unwrap();
            assert_eq!(request.version, "20");
            assert_eq!(request.source_label, "KEEL_NODE_VERSION");
        }
    }

    #[test]
    fn equal_priority_takes_last_call() {
        let (_tmp, mut resolver) = test_resolver();
        let node = resolver.default("node", "22");
        resolver.version(&node, "18", ".nvmrc", VersionSource::RepoFile);
        resolver.version(&node, "19", ".node-version", VersionSource::RepoFile);

        let request = resolver.get("node").unwrap();
        assert_eq!(request.version, "19");
        assert_eq!(request.source_label, ".node-version");
    }

    #[test]
    fn empty_pin_is_ignored() {
        let (_tmp, mut resolver) = test_resolver();
        let node = resolver.default("node", "22");
        resolver.version(&node, "  ", ".nvmrc", VersionSource::RepoFile);
        assert_eq!(resolver.get("node").unwrap().version, "22");
    }

    #[tokio::test]
    async fn resolve_all_uses_default_when_unpinned() {
        let (_tmp, mut resolver) = test_resolver();
        resolver.default("node", "22");

        let resolved = resolver.resolve_all(&node_oracle()).await.unwrap();
        let node = &resolved["node"];
        assert_eq!(node.requested_version, "22");
        assert_eq!(node.resolved_version, "22.9.0");
        assert_eq!(node.source, "default");
    }

    #[tokio::test]
    async fn resolve_all_reports_pin_source() {
        let (_tmp, mut resolver) = test_resolver();
        let node = resolver.default("node", "22");
        resolver.version(&node, "18", ".nvmrc", VersionSource::RepoFile);

        let resolved = resolver.resolve_all(&node_oracle()).await.unwrap();
        assert_eq!(resolved["node"].resolved_version, "18.20.5");
        assert_eq!(resolved["node"].source, ".nvmrc");
    }

    #[tokio::test]
    async fn resolve_all_retries_with_raw_token() {
        // "lts/hydrogen" has no semver token the oracle can use, so the raw
        // string is retried and matched exactly.
        let oracle = StaticVersionOracle::new().with_versions("node", ["lts/hydrogen", "22.9.0"]);
        let (_tmp, mut resolver) = test_resolver();
        let node = resolver.default("node", "22");
        resolver.version(&node, "lts/hydrogen", ".nvmrc", VersionSource::RepoFile);

        let resolved = resolver.resolve_all(&oracle).await.unwrap();
        assert_eq!(resolved["node"].resolved_version, "lts/hydrogen");
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_guidance() {
        let (_tmp, mut resolver) = test_resolver();
        resolver.default("imagemagick", "7");

        let err = resolver.resolve_all(&node_oracle()).await.unwrap_err();
        assert!(matches!(err, KeelError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn resolution_failure_carries_constraint() {
        let (_tmp, mut resolver) = test_resolver();
        resolver.default("node", "999");

        let err = resolver.resolve_all(&node_oracle()).await.unwrap_err();
        match err {
            KeelError::VersionResolution { tool, constraint, .. } => {
                assert_eq!(tool, "node");
                assert_eq!(constraint, "999");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn semver_token_extraction() {
        assert_eq!(extract_semver_token("v18.20"), "18.20");
        assert_eq!(extract_semver_token(">=1.2.3"), "1.2.3");
        assert_eq!(extract_semver_token("latest"), "latest");
        assert_eq!(extract_semver_token(" 3.13 "), "3.13");
    }
}
