//! Plan validation: the invariants every emitted plan must satisfy.

use std::collections::{BTreeMap, BTreeSet};

use keel_common::{KeelError, KeelResult};

use crate::plan::BuildPlan;

/// Validate a normalized plan:
/// - every referenced cache and secret is declared,
/// - every step layer references an existing step,
/// - the dependency digraph is acyclic,
/// - a step's first input carries no filter,
/// - the deploy descriptor has a start command (when required).
///
/// # Errors
///
/// Returns the first violated invariant as a typed error.
pub fn validate_plan(
    plan: &BuildPlan,
    start_command_help: Option<&str>,
) -> KeelResult<()> {
    let step_names: BTreeSet<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
    let declared_secrets: BTreeSet<&str> = plan.secrets.iter().map(String::as_str).collect();

    for step in &plan.steps {
        for cache in &step.caches {
            if !plan.caches.contains_key(cache) {
                return Err(KeelError::UnknownCache {
                    name: cache.clone(),
                });
            }
        }

        for secret in &step.secrets {
            if secret != "*" && !declared_secrets.contains(secret.as_str()) {
                return Err(KeelError::UnknownSecret {
                    name: secret.clone(),
                });
            }
        }

        let mut refs = Vec::new();
        for input in &step.inputs {
            input.collect_step_refs(&mut refs);
        }
        for reference in refs {
            if !step_names.contains(reference) {
                return Err(KeelError::Config {
                    message: format!(
                        "step `{}` references unknown step `{reference}`",
                        step.name
                    ),
                });
            }
        }

        if let Some(first) = step.inputs.first() {
            if first.filter().is_some_and(|filter| !filter.is_empty()) {
                return Err(KeelError::Config {
                    message: format!(
                        "step `{}`: the first input must not have include or exclude paths",
                        step.name
                    ),
                });
            }
        } else if step.starting_image.is_none() && !step.commands.is_empty() {
            tracing::warn!(step = %step.name, "step has commands but no inputs");
        }
    }

    check_acyclic(plan)?;

    if plan.deploy.start_cmd.is_none() {
        let help = start_command_help.unwrap_or("").trim();
        tracing::error!("no start command could be determined");
        return Err(KeelError::Config {
            message: if help.is_empty() {
                "no start command could be determined".to_string()
            } else {
                format!("no start command could be determined\n\n{help}")
            },
        });
    }

    if !plan.steps.iter().any(|step| !step.commands.is_empty()) {
        tracing::warn!("plan contains no commands");
    }

    Ok(())
}

/// Depth-first cycle check over `dependsOn` and step-layer edges.
fn check_acyclic(plan: &BuildPlan) -> KeelResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        plan: &'a BuildPlan,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> KeelResult<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut path: Vec<&str> = stack[start..].to_vec();
                path.push(name);
                return Err(KeelError::CyclicGraph {
                    path: path.join(" -> "),
                });
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(step) = plan.get_step(name) {
            for dep in step.referenced_steps() {
                visit(dep, plan, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    for step in &plan.steps {
        visit(&step.name, plan, &mut marks, &mut stack)?;
    }
    Ok(())
}
