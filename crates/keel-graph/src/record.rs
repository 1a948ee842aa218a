//! A deterministic in-memory sink.
//!
//! Records every operation in an append-only log; a layer handle is the
//! index of the operation that produced it. The serialized log is canonical,
//! so two compilations of the same plan yield byte-identical JSON and equal
//! digests.

use std::collections::BTreeMap;

use keel_common::KeelResult;
use keel_core::plan::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::sink::{
    CacheMount, CacheStore, CopyOptions, ImageBuilder, LayerId, RunOptions,
};

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Op {
    /// Image import.
    #[serde(rename_all = "camelCase")]
    Image {
        /// Image reference.
        reference: String,
        /// Platform tag.
        platform: String,
    },
    /// Empty rootfs.
    Scratch,
    /// The local source tree.
    Local,
    /// Copy between layers.
    #[serde(rename_all = "camelCase")]
    Copy {
        /// Destination layer.
        dst: LayerId,
        /// Source layer.
        src: LayerId,
        /// Source path.
        src_path: String,
        /// Destination path.
        dest_path: String,
        /// Copy options.
        options: CopyOptions,
        /// Display name.
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
    },
    /// Exec in a rootfs.
    #[serde(rename_all = "camelCase")]
    Run {
        /// Input layer.
        state: LayerId,
        /// Command argv.
        argv: Vec<String>,
        /// Exec options.
        options: RunOptions,
    },
    /// Directory creation.
    #[serde(rename_all = "camelCase")]
    Mkdir {
        /// Input layer.
        state: LayerId,
        /// Directory path.
        path: String,
        /// Mode bits.
        mode: u32,
        /// Create missing parents.
        make_parents: bool,
    },
    /// File creation.
    #[serde(rename_all = "camelCase")]
    Mkfile {
        /// Input layer.
        state: LayerId,
        /// File path.
        path: String,
        /// Mode bits.
        mode: u32,
        /// File contents.
        data: String,
        /// Display name.
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
    },
    /// Environment variable on a layer.
    #[serde(rename_all = "camelCase")]
    AddEnv {
        /// Input layer.
        state: LayerId,
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Native merge.
    #[serde(rename_all = "camelCase")]
    Merge {
        /// Layers to merge, in order.
        inputs: Vec<LayerId>,
        /// Display name.
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
    },
}

/// An [`ImageBuilder`] that records operations instead of executing them.
#[derive(Debug, Default)]
pub struct RecordingSink {
    ops: Vec<Op>,
}

impl RecordingSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the local source tree as a layer.
    pub fn local(&mut self) -> LayerId {
        self.push(Op::Local)
    }

    /// The recorded operation log.
    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// The op log as canonical JSON.
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn to_json(&self) -> KeelResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.ops)?)
    }

    /// Digest over the canonical serialization of the log.
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn digest(&self) -> KeelResult<String> {
        let encoded = serde_json::to_vec(&self.ops)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    fn push(&mut self, op: Op) -> LayerId {
        self.ops.push(op);
        self.ops.len() - 1
    }
}

impl ImageBuilder for RecordingSink {
    fn image(&mut self, reference: &str, platform: &str) -> KeelResult<LayerId> {
        Ok(self.push(Op::Image {
            reference: reference.to_string(),
            platform: platform.to_string(),
        }))
    }

    fn scratch(&mut self) -> KeelResult<LayerId> {
        Ok(self.push(Op::Scratch))
    }

    fn copy(
        &mut self,
        dst: LayerId,
        src: LayerId,
        src_path: &str,
        dest_path: &str,
        options: &CopyOptions,
        custom_name: Option<&str>,
    ) -> KeelResult<LayerId> {
        Ok(self.push(Op::Copy {
            dst,
            src,
            src_path: src_path.to_string(),
            dest_path: dest_path.to_string(),
            options: options.clone(),
            custom_name: custom_name.map(ToString::to_string),
        }))
    }

    fn run(&mut self, state: LayerId, argv: &[String], options: &RunOptions) -> KeelResult<LayerId> {
        Ok(self.push(Op::Run {
            state,
            argv: argv.to_vec(),
            options: options.clone(),
        }))
    }

    fn mkdir(
        &mut self,
        state: LayerId,
        path: &str,
        mode: u32,
        make_parents: bool,
    ) -> KeelResult<LayerId> {
        Ok(self.push(Op::Mkdir {
            state,
            path: path.to_string(),
            mode,
            make_parents,
        }))
    }

    fn mkfile(
        &mut self,
        state: LayerId,
        path: &str,
        mode: u32,
        data: &[u8],
        custom_name: Option<&str>,
    ) -> KeelResult<LayerId> {
        Ok(self.push(Op::Mkfile {
            state,
            path: path.to_string(),
            mode,
            data: String::from_utf8_lossy(data).into_owned(),
            custom_name: custom_name.map(ToString::to_string),
        }))
    }

    fn add_env(&mut self, state: LayerId, key: &str, value: &str) -> KeelResult<LayerId> {
        Ok(self.push(Op::AddEnv {
            state,
            key: key.to_string(),
            value: value.to_string(),
        }))
    }

    fn merge(&mut self, layers: &[LayerId], custom_name: Option<&str>) -> KeelResult<LayerId> {
        Ok(self.push(Op::Merge {
            inputs: layers.to_vec(),
            custom_name: custom_name.map(ToString::to_string),
        }))
    }
}

/// A map-backed cache store: cache identity is derived from the key, so the
/// same key always resolves to the same mount.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    known: BTreeMap<String, CacheMount>,
}

impl MemoryCacheStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get_cache(&mut self, key: &str, cache: &Cache) -> CacheMount {
        self.known
            .entry(key.to_string())
            .or_insert_with(|| CacheMount {
                cache_id: format!("keel-cache-{key}"),
                directory: cache.directory.clone(),
                sharing: cache.cache_type.into(),
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ids_are_op_indices() {
        let mut sink = RecordingSink::new();
        let image = sink.image("alpine:3.19", "linux/amd64").unwrap();
        let scratch = sink.scratch().unwrap();
        assert_eq!(image, 0);
        assert_eq!(scratch, 1);
        assert_eq!(sink.ops().len(), 2);
    }

    #[test]
    fn digest_is_stable() {
        let build = || {
            let mut sink = RecordingSink::new();
            let base = sink.image("alpine:3.19", "linux/amd64").unwrap();
            let argv = vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()];
            sink.run(base, &argv, &RunOptions::default()).unwrap();
            sink.digest().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn cache_store_dedups_by_key() {
        let mut store = MemoryCacheStore::new();
        let cache = Cache::shared("/root/.npm");
        let a = store.get_cache("npm-install", &cache);
        let b = store.get_cache("npm-install", &Cache::locked("/elsewhere"));
        assert_eq!(a, b);
        assert_eq!(a.cache_id, "keel-cache-npm-install");
    }
}
