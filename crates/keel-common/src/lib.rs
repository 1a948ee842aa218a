//! # keel-common
//!
//! Shared utilities and types for the Keel build planner.
//!
//! This crate provides common functionality used across all Keel crates:
//! - Common error types
//! - Standard filesystem paths for the tool-version cache

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{KeelError, KeelResult};
pub use paths::KeelPaths;
