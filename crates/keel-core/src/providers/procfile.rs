//! Procfile provider.
//!
//! A secondary provider: it runs in addition to the selected language
//! provider and only contributes the start command.

use std::collections::BTreeMap;

use keel_common::KeelResult;

use crate::generate::GenerateContext;

use super::Provider;

/// Process types consulted in order of preference.
const PREFERRED_PROCESSES: [&str; 2] = ["web", "worker"];

/// Reads a `Procfile` and sets the deploy start command from it.
#[derive(Debug, Default)]
pub struct ProcfileProvider;

impl ProcfileProvider {
    fn processes(ctx: &GenerateContext) -> KeelResult<BTreeMap<String, String>> {
        ctx.app().read_yaml("Procfile")
    }
}

impl Provider for ProcfileProvider {
    fn name(&self) -> &'static str {
        "procfile"
    }

    fn detect(&self, ctx: &GenerateContext) -> KeelResult<bool> {
        Ok(ctx.app().has_file("Procfile"))
    }

    fn plan(&self, ctx: &mut GenerateContext) -> KeelResult<()> {
        let processes = Self::processes(ctx)?;

        let command = PREFERRED_PROCESSES
            .iter()
            .find_map(|name| processes.get(*name))
            .or_else(|| processes.values().next());

        if let Some(command) = command {
            ctx.deploy.start_cmd = Some(command.clone());
            ctx.metadata.set("procfile", "true");
        }

        Ok(())
    }
}
