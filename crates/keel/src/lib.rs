//! # keel
//!
//! The Keel CLI: generate a build plan for a source tree (`plan`), print the
//! config schema (`schema`), or compile the plan into a backend DAG
//! (`build`).

#![warn(missing_docs)]

pub mod build;
pub mod cli;

pub use cli::Cli;
