//! # keel-core
//!
//! Build-plan generation for Keel.
//!
//! This crate turns an arbitrary source tree into a declarative
//! [`plan::BuildPlan`]:
//! - [`app`] answers read-only queries over the source tree and environment
//! - [`providers`] detect language idioms and contribute steps
//! - [`resolver`] negotiates tool versions against an external oracle
//! - [`generate`] orchestrates providers and user config into a plan
//! - [`cleanse`] and [`plan::BuildPlan::normalize`] post-process the plan

#![warn(missing_docs)]

pub mod app;
pub mod cleanse;
pub mod config;
pub mod generate;
pub mod plan;
pub mod providers;
pub mod resolver;
pub mod validate;

mod result;

pub use result::{
    BuildResult, DEFAULT_START_COMMAND_HELP, GenerateOptions, LogLevel, LogRecord, error_message,
    generate_build_plan,
};
