//! # keel-graph
//!
//! Compiles a frozen [`keel_core::plan::BuildPlan`] into a DAG of
//! filesystem-layer operations for an image-build backend:
//! - [`sink`] defines the [`sink::ImageBuilder`] operation surface
//! - [`graph`] walks the step graph in topological order, threads the
//!   environment and `PATH`, merges parent states and compiles commands
//! - [`layers`] lowers declarative layers with a merge-or-copy policy
//! - [`secrets`] derives the secrets-hash artifacts controlling cache
//!   invalidation
//! - [`record`] is a deterministic in-memory sink for tests and the CLI

#![warn(missing_docs)]

pub mod environment;
pub mod graph;
pub mod layers;
pub mod record;
pub mod secrets;
pub mod sink;

mod node;

pub use environment::{BuildEnvironment, SYSTEM_DEFAULT_PATH};
pub use graph::{BuildGraph, BuildGraphOutput, GraphOptions};
pub use layers::{has_path_overlap, should_merge_layers};
pub use record::{MemoryCacheStore, Op, RecordingSink};
pub use sink::{CacheMount, CacheSharing, CacheStore, CopyOptions, ImageBuilder, LayerId, RunOptions};
