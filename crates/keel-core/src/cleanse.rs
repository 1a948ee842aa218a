//! Post-generation plan cleansing.
//!
//! Detaches the node-modules cache from steps whose commands destroy the
//! cache directory, either directly (`rm -rf node_modules`, `rimraf`) or
//! implicitly (`npm ci` performs a clean install). Mounting the cache into
//! such a step would invalidate its content hash on every build.
//!
//! Detection is regex-based over the raw command strings, not a shell AST.
//! Quoted commands or variable substitution can slip through (a stale cache,
//! never a corrupted build); a false positive only costs install speed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::plan::{BuildPlan, Command};
use crate::providers::node::NODE_MODULES_CACHE;

/// Matches `npm ci` with flexible whitespace, using word boundaries.
static NPM_CI_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bnpm\s+ci\b").expect("npm ci regex"));

/// Matches delete commands targeting node_modules.
static REMOVE_NODE_MODULES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:rm\s+-r[f]?|rmdir|rimraf)\s+(?:\S*/)?node_modules\b")
        .expect("remove node_modules regex")
});

fn will_remove_node_modules(commands: &[Command]) -> bool {
    commands.iter().any(|command| match command {
        Command::Exec { cmd, .. } => {
            NPM_CI_COMMAND.is_match(cmd) || REMOVE_NODE_MODULES.is_match(cmd)
        }
        _ => false,
    })
}

/// Apply structural cleanups to a generated plan.
///
/// The global cache definition is kept so earlier steps (like `install`,
/// which is exempt by name) can still mount it.
pub fn cleanse_build_plan(plan: &mut BuildPlan) {
    let Some(node_modules_key) = plan
        .caches
        .iter()
        .find(|(_, cache)| cache.directory == NODE_MODULES_CACHE)
        .map(|(name, _)| name.clone())
    else {
        return;
    };

    for step in &mut plan.steps {
        if step.name == "install" || step.caches.is_empty() {
            continue;
        }
        if will_remove_node_modules(&step.commands) {
            tracing::debug!(step = %step.name, "detaching node-modules cache from destructive step");
            step.caches
                .retain(|name| !name.is_empty() && name != &node_modules_key);
        }
    }
}
