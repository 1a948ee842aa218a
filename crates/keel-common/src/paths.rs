//! Standard filesystem paths for the Keel tool-version cache.
//!
//! The tool cache is the only process-shared state in Keel. Concurrent
//! invocations serialize on per-tool lock files inside `locks/`.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for the tool-version cache.
pub static KEEL_CACHE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEEL_CACHE_DIR").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("keel")
            .join("toolchains")
    })
});

/// Standard paths used by the tool resolver.
#[derive(Debug, Clone)]
pub struct KeelPaths {
    /// Root of the tool cache (default: `~/.cache/keel/toolchains`).
    pub root: PathBuf,
}

impl KeelPaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Download cache for the version service client.
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Installed tool data.
    #[must_use]
    pub fn data(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Resolver state that survives between invocations.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Host-wide tool configuration.
    #[must_use]
    pub fn system(&self) -> PathBuf {
        self.root.join("system")
    }

    /// Directory holding per-tool lock files.
    #[must_use]
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock file for a single tool. Slashes in tool names (e.g.
    /// `aqua:owner/repo`) are not valid in file names and are replaced.
    #[must_use]
    pub fn tool_lock(&self, tool: &str) -> PathBuf {
        self.locks().join(format!("lock-{}", tool.replace('/', "-")))
    }

    /// Create all cache directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.cache())?;
        std::fs::create_dir_all(self.data())?;
        std::fs::create_dir_all(self.state())?;
        std::fs::create_dir_all(self.system())?;
        std::fs::create_dir_all(self.locks())?;
        Ok(())
    }
}

impl Default for KeelPaths {
    fn default() -> Self {
        Self {
            root: KEEL_CACHE_ROOT.clone(),
        }
    }
}
