//! The external version service interface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_common::{KeelError, KeelResult};
use semver::{Version, VersionReq};

/// Answers "latest version of `tool` matching `constraint`".
///
/// The real implementation talks to an external version service and caches
/// results under the tool cache directory; it is injected so generation can
/// run hermetically. Implementations must be safe to call concurrently for
/// different tools; the resolver guarantees per-tool mutual exclusion.
#[async_trait]
pub trait VersionOracle: Send + Sync {
    /// Resolve the latest concrete version matching the constraint.
    ///
    /// Returns `Ok(None)` when the tool is known but nothing matches, and
    /// [`KeelError::UnknownTool`] when the tool does not exist at all.
    ///
    /// # Errors
    ///
    /// Any transport or service failure.
    async fn latest_matching(&self, tool: &str, constraint: &str) -> KeelResult<Option<String>>;
}

/// A map-backed oracle for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticVersionOracle {
    versions: BTreeMap<String, Vec<String>>,
}

impl StaticVersionOracle {
    /// Create an empty oracle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the known versions of a tool.
    #[must_use]
    pub fn with_versions<S: Into<String>>(
        mut self,
        tool: impl Into<String>,
        versions: impl IntoIterator<Item = S>,
    ) -> Self {
        self.versions
            .insert(tool.into(), versions.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl VersionOracle for StaticVersionOracle {
    async fn latest_matching(&self, tool: &str, constraint: &str) -> KeelResult<Option<String>> {
        let Some(versions) = self.versions.get(tool) else {
            return Err(KeelError::UnknownTool {
                tool: tool.to_string(),
            });
        };

        let mut candidates: Vec<(Version, &str)> = versions
            .iter()
            .filter_map(|raw| lenient_version(raw).map(|v| (v, raw.as_str())))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        if constraint == "latest" {
            return Ok(candidates.last().map(|(_, raw)| (*raw).to_string()));
        }

        let Some(req) = lenient_requirement(constraint) else {
            // Non-semver token: fall back to exact string match.
            return Ok(versions.iter().find(|v| *v == constraint).cloned());
        };

        Ok(candidates
            .iter()
            .rev()
            .find(|(version, _)| req.matches(version))
            .map(|(_, raw)| (*raw).to_string()))
    }
}

/// An oracle that echoes the constraint back as the resolved version. Used
/// by the CLI when no version service is reachable so plans stay generable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughOracle;

#[async_trait]
impl VersionOracle for PassthroughOracle {
    async fn latest_matching(&self, _tool: &str, constraint: &str) -> KeelResult<Option<String>> {
        Ok(Some(constraint.to_string()))
    }
}

/// Parse a possibly partial version (`18`, `18.20`) by padding missing
/// components.
#[must_use]
pub fn lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let parts: Vec<&str> = raw.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).ok()
}

/// Parse a constraint, treating bare versions as caret requirements the way
/// package manifests do.
#[must_use]
pub fn lenient_requirement(raw: &str) -> Option<VersionReq> {
    VersionReq::parse(raw.trim()).ok()
}
