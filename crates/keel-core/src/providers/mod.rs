//! Language and framework providers.
//!
//! Each provider detects its idiom in the source tree and contributes tool
//! requests, steps and deploy metadata through the [`GenerateContext`].
//! Detection order is fixed; the first provider whose `detect` returns true
//! is selected and the rest are not consulted. Secondary providers (the
//! Procfile reader) run in addition to the selected one.

pub mod golang;
pub mod node;
pub mod procfile;
pub mod python;
pub mod rust;
pub mod shell;
pub mod staticfile;

use keel_common::KeelResult;

use crate::generate::GenerateContext;
use crate::plan::BuildPlan;

/// A detector and plan generator for one language or framework idiom.
///
/// Providers must not reach into each other's state; they compose only
/// through the shared [`GenerateContext`].
pub trait Provider {
    /// Stable provider name, usable in the `provider` config field.
    fn name(&self) -> &'static str;

    /// Whether this provider recognizes the source tree.
    ///
    /// # Errors
    ///
    /// Propagates source-tree read failures.
    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool>;

    /// Load provider state from the source tree before planning.
    ///
    /// # Errors
    ///
    /// Propagates parse failures of files the provider depends on.
    fn initialize(&mut self, _ctx: &GenerateContext) -> KeelResult<()> {
        Ok(())
    }

    /// Contribute steps, tool requests and deploy metadata.
    ///
    /// # Errors
    ///
    /// Propagates read and parse failures.
    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()>;

    /// Guidance shown when no start command could be determined.
    fn start_command_help(&self) -> &'static str {
        ""
    }

    /// Provider-specific plan mutations after normalization.
    fn cleanse_plan(&self, _plan: &mut BuildPlan) {}
}

/// The fixed, ordered list of primary providers.
#[must_use]
pub fn primary_providers() -> Vec<Box<dyn Provider>> {
    vec![
        Box::new(golang::GolangProvider::default()),
        Box::new(node::NodeProvider::default()),
        Box::new(python::PythonProvider::default()),
        Box::new(rust::RustProvider::default()),
        Box::new(staticfile::StaticfileProvider::default()),
        Box::new(shell::ShellProvider::default()),
    ]
}

/// Secondary providers that run in addition to the selected one, gated on
/// their own detection.
#[must_use]
pub fn secondary_providers() -> Vec<Box<dyn Provider>> {
    vec![Box::new(procfile::ProcfileProvider)]
}

/// Look up a primary provider by name.
#[must_use]
pub fn get_provider(name: &str) -> Option<Box<dyn Provider>> {
    primary_providers()
        .into_iter()
        .find(|provider| provider.name() == name)
}
