//! The image-build backend interface.
//!
//! The backend consumes a content-addressed DAG of filesystem operations.
//! Every operation returns an opaque [`LayerId`] naming the produced layer;
//! the graph never inspects layer contents. All dependencies are explicit in
//! the operation arguments, so a backend is free to execute the DAG with any
//! parallelism it likes.

use keel_core::plan::{Cache, CacheType};
use keel_common::KeelResult;
use serde::Serialize;

/// Opaque handle to a layer produced by a sink operation.
pub type LayerId = usize;

/// Options for copy operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOptions {
    /// Create the destination path when missing.
    pub create_dest_path: bool,
    /// Follow symlinks in the source.
    pub follow_symlinks: bool,
    /// Copy the contents of a source directory rather than the directory.
    pub copy_dir_contents: bool,
    /// Allow wildcard patterns in the source path.
    pub allow_wildcard: bool,
    /// Do not fail when a wildcard matches nothing.
    pub allow_empty_wildcard: bool,
    /// Patterns excluded from the copy.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
}

impl CopyOptions {
    /// The option set used for whole-rootfs merges.
    #[must_use]
    pub fn merge() -> Self {
        CopyOptions {
            create_dest_path: true,
            follow_symlinks: true,
            allow_wildcard: true,
            ..CopyOptions::default()
        }
    }

    /// The option set used for copy commands and layer projections.
    #[must_use]
    pub fn projection() -> Self {
        CopyOptions {
            create_dest_path: true,
            follow_symlinks: true,
            allow_wildcard: true,
            allow_empty_wildcard: true,
            ..CopyOptions::default()
        }
    }
}

/// How concurrent execs share a cache mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    /// Concurrent readers and writers.
    Shared,
    /// One exec at a time.
    Locked,
}

impl From<CacheType> for CacheSharing {
    fn from(cache_type: CacheType) -> Self {
        match cache_type {
            CacheType::Shared => CacheSharing::Shared,
            CacheType::Locked => CacheSharing::Locked,
        }
    }
}

/// A persistent cache mount bound into an exec command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMount {
    /// Backend cache identity; equal ids share storage.
    pub cache_id: String,
    /// Mount point inside the rootfs.
    pub directory: String,
    /// Sharing mode.
    pub sharing: CacheSharing,
}

/// A read-only file mount sourced from another layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMount {
    /// Mount point inside the rootfs.
    pub path: String,
    /// Layer providing the mounted content.
    pub source: LayerId,
}

/// Options for exec operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Working directory.
    pub cwd: String,
    /// Secrets mounted as environment variables of the same name.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// File mounts (secrets-hash artifacts).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<FileMount>,
    /// Persistent cache mounts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheMount>,
    /// Display name for the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

/// The operation surface of the image-build backend.
pub trait ImageBuilder {
    /// Import an OCI image for a platform.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn image(&mut self, reference: &str, platform: &str) -> KeelResult<LayerId>;

    /// An empty rootfs.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn scratch(&mut self) -> KeelResult<LayerId>;

    /// Copy a path from one layer onto another, producing a new layer.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn copy(
        &mut self,
        dst: LayerId,
        src: LayerId,
        src_path: &str,
        dest_path: &str,
        options: &CopyOptions,
        custom_name: Option<&str>,
    ) -> KeelResult<LayerId>;

    /// Run a command in a rootfs, producing the modified rootfs.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn run(&mut self, state: LayerId, argv: &[String], options: &RunOptions) -> KeelResult<LayerId>;

    /// Create a directory (optionally with parents).
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn mkdir(&mut self, state: LayerId, path: &str, mode: u32, make_parents: bool)
    -> KeelResult<LayerId>;

    /// Write a file with the given mode and contents.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn mkfile(
        &mut self,
        state: LayerId,
        path: &str,
        mode: u32,
        data: &[u8],
        custom_name: Option<&str>,
    ) -> KeelResult<LayerId>;

    /// Record an environment variable on a layer.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn add_env(&mut self, state: LayerId, key: &str, value: &str) -> KeelResult<LayerId>;

    /// Native merge of layers with pairwise-disjoint contents.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn merge(&mut self, layers: &[LayerId], custom_name: Option<&str>) -> KeelResult<LayerId>;
}

/// Resolves plan cache definitions to backend cache mounts. Implementations
/// must return the same identity for the same key within one build.
pub trait CacheStore {
    /// The mount for a named cache.
    fn get_cache(&mut self, key: &str, cache: &Cache) -> CacheMount;
}
