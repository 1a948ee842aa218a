//! Topologically ordered compilation of a plan into sink operations.

use std::collections::{BTreeMap, BTreeSet};

use keel_common::{KeelError, KeelResult};
use keel_core::plan::{BuildPlan, Command, Step};

use crate::environment::BuildEnvironment;
use crate::node::StepNode;
use crate::sink::{
    CacheMount, CacheStore, CopyOptions, FileMount, ImageBuilder, LayerId, RunOptions,
};

/// Working directory every step runs in.
pub(crate) const APP_DIR: &str = "/app";

/// Inputs for graph compilation beyond the plan itself.
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    /// Platform tag passed to image imports, e.g. `linux/amd64`.
    pub platform: String,
    /// Digest covering all secret values; enables secrets-hash mounts.
    pub secrets_hash: Option<String>,
}

/// The compiled graph result: the final layer and the merged environment of
/// all leaf steps (the deploy build env contract).
#[derive(Debug, Clone)]
pub struct BuildGraphOutput {
    /// The merged leaf state (or the base state for an empty graph).
    pub state: LayerId,
    /// Merged leaf environment.
    pub env: BuildEnvironment,
}

/// Compiles a [`BuildPlan`] into operations on an [`ImageBuilder`] sink.
///
/// Node state is created per compilation and discarded with the graph; the
/// plan itself stays frozen. The walk is sequential and deterministic, so
/// identical inputs produce identical DAGs.
pub struct BuildGraph<'a> {
    pub(crate) plan: &'a BuildPlan,
    pub(crate) sink: &'a mut dyn ImageBuilder,
    pub(crate) cache_store: &'a mut dyn CacheStore,
    pub(crate) platform: String,
    pub(crate) base_state: LayerId,
    pub(crate) local_state: LayerId,
    pub(crate) nodes: Vec<StepNode>,
    pub(crate) index: BTreeMap<String, usize>,
    topo_pos: Vec<usize>,
    secrets_hash_file: Option<LayerId>,
    used_secrets_base: Option<LayerId>,
}

impl<'a> BuildGraph<'a> {
    /// Build the node table and dependency edges for a plan.
    ///
    /// # Errors
    ///
    /// Propagates sink failures while preparing the secrets-hash layers.
    pub fn new(
        plan: &'a BuildPlan,
        base_state: LayerId,
        local_state: LayerId,
        sink: &'a mut dyn ImageBuilder,
        cache_store: &'a mut dyn CacheStore,
        options: &GraphOptions,
    ) -> KeelResult<Self> {
        let platform = if options.platform.is_empty() {
            "linux/amd64".to_string()
        } else {
            options.platform.clone()
        };

        let mut secrets_hash_file = None;
        let mut used_secrets_base = None;
        if let Some(hash) = &options.secrets_hash {
            let scratch = sink.scratch()?;
            secrets_hash_file = Some(sink.mkfile(
                scratch,
                "/secrets-hash",
                0o644,
                hash.as_bytes(),
                Some("[keel] secrets hash"),
            )?);
            used_secrets_base = Some(sink.image("alpine:latest", &platform)?);
        }

        let mut nodes: Vec<StepNode> = plan
            .steps
            .iter()
            .map(|step| StepNode::new(step.clone()))
            .collect();
        let index: BTreeMap<String, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name.clone(), i))
            .collect();

        for child in 0..nodes.len() {
            let refs: Vec<String> = nodes[child]
                .step
                .referenced_steps()
                .into_iter()
                .map(ToString::to_string)
                .collect();
            for reference in refs {
                let Some(&parent) = index.get(&reference) else {
                    continue;
                };
                if parent == child || nodes[child].parents.contains(&parent) {
                    continue;
                }
                nodes[child].parents.push(parent);
                nodes[parent].children.push(child);
            }
        }

        Ok(BuildGraph {
            plan,
            sink,
            cache_store,
            platform,
            base_state,
            local_state,
            nodes,
            index,
            topo_pos: Vec::new(),
            secrets_hash_file,
            used_secrets_base,
        })
    }

    /// Process every node in topological order and merge the leaves.
    ///
    /// # Errors
    ///
    /// [`KeelError::CyclicGraph`] on cycles, plus any compilation failure
    /// wrapped with the failing step's name.
    pub fn build(&mut self) -> KeelResult<BuildGraphOutput> {
        let order = self.processing_order()?;

        self.topo_pos = vec![0; self.nodes.len()];
        for (position, &idx) in order.iter().enumerate() {
            self.topo_pos[idx] = position;
        }

        for idx in order {
            let name = self.nodes[idx].step.name.clone();
            self.process_node(idx)
                .map_err(|err| with_step_context(err, &name))?;
        }

        let mut leaves: Vec<usize> = (0..self.nodes.len())
            .filter(|&idx| self.nodes[idx].children.is_empty() && self.nodes[idx].state.is_some())
            .collect();
        leaves.sort_by_key(|&idx| self.topo_pos[idx]);

        let mut env = BuildEnvironment::new();
        for &idx in &leaves {
            env.merge(&self.nodes[idx].output_env);
        }

        let state = match leaves.as_slice() {
            [] => self.base_state,
            [only] => self.nodes[*only].state.expect("leaf has state"),
            _ => self.merge_nodes(&leaves)?,
        };

        Ok(BuildGraphOutput { state, env })
    }

    /// Kahn ordering over the node table, stable by node index.
    fn processing_order(&self) -> KeelResult<Vec<usize>> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.parents.len()).collect();
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&idx) = ready.iter().next() {
            ready.remove(&idx);
            order.push(idx);
            for &child in &self.nodes[idx].children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(KeelError::CyclicGraph {
                path: self.find_cycle_path(&order),
            });
        }
        Ok(order)
    }

    /// Reconstruct one cycle among the nodes Kahn could not order.
    fn find_cycle_path(&self, ordered: &[usize]) -> String {
        let done: BTreeSet<usize> = ordered.iter().copied().collect();
        let Some(start) = (0..self.nodes.len()).find(|idx| !done.contains(idx)) else {
            return String::new();
        };

        let mut path = vec![start];
        let mut seen: BTreeSet<usize> = BTreeSet::from([start]);
        let mut current = start;
        loop {
            let Some(&next) = self.nodes[current]
                .parents
                .iter()
                .find(|p| !done.contains(*p))
            else {
                break;
            };
            if !seen.insert(next) {
                path.push(next);
                let entry = path.iter().position(|&n| n == next).unwrap_or(0);
                let names: Vec<&str> = path[entry..]
                    .iter()
                    .map(|&idx| self.nodes[idx].step.name.as_str())
                    .collect();
                return names.join(" -> ");
            }
            path.push(next);
            current = next;
        }
        self.nodes[start].step.name.clone()
    }

    fn process_node(&mut self, idx: usize) -> KeelResult<()> {
        if self.nodes[idx].processed {
            return Ok(());
        }
        self.nodes[idx].in_progress = true;

        // Parents sorted topologically so later writers win deterministically.
        let mut parents = self.nodes[idx].parents.clone();
        let mut env_parents = parents.clone();
        env_parents.sort_by_key(|&p| self.topo_pos[p]);

        let mut input_env = BuildEnvironment::new();
        for &parent in &env_parents {
            if !self.nodes[parent].processed {
                return Err(KeelError::DependencyViolation {
                    parent: self.nodes[parent].step.name.clone(),
                    child: self.nodes[idx].step.name.clone(),
                });
            }
            input_env.merge(&self.nodes[parent].output_env);
        }
        self.nodes[idx].input_env = input_env;

        // State merges follow dependency-insertion order.
        parents.dedup();
        let base = self.node_base_state(idx, &parents)?;
        let state = self.compile_node(idx, base)?;

        self.nodes[idx].state = Some(state);
        self.nodes[idx].processed = true;
        self.nodes[idx].in_progress = false;
        Ok(())
    }

    /// The layer a step's commands run over.
    fn node_base_state(&mut self, idx: usize, parents: &[usize]) -> KeelResult<LayerId> {
        let step = self.nodes[idx].step.clone();

        if let Some(image) = &step.starting_image {
            return self.sink.image(image, &self.platform);
        }
        if !step.inputs.is_empty() {
            return self.state_for_layers(&step.inputs);
        }
        if parents.is_empty() {
            return Ok(self.base_state);
        }
        self.merge_nodes(parents)
    }

    /// Apply environment, run commands and project declared outputs.
    fn compile_node(&mut self, idx: usize, base: LayerId) -> KeelResult<LayerId> {
        let step = self.nodes[idx].step.clone();
        let mut state = base;

        // Env vars from the parents plus the step's own, written in sorted
        // key order for deterministic layer hashing.
        let mut env_vars = self.nodes[idx].input_env.vars.clone();
        for (key, value) in &step.variables {
            env_vars.insert(key.clone(), value.clone());
        }
        for (key, value) in &env_vars {
            state = self.sink.add_env(state, key, value)?;
            self.nodes[idx].output_env.add_var(key.clone(), value.clone());
        }

        let inherited_paths = self.nodes[idx].input_env.paths.clone();
        if let Some(path) = self.nodes[idx].input_env.path_value() {
            state = self.sink.add_env(state, "PATH", &path)?;
            for path in inherited_paths {
                self.nodes[idx].output_env.add_path(path);
            }
        }

        for command in step.commands.clone() {
            state = self.compile_command(idx, &step, &command, state)?;
        }

        if let Some(outputs) = step.outputs.as_ref().filter(|o| !o.is_empty()) {
            state = self.project_outputs(&step, outputs, base, state)?;
        }

        Ok(state)
    }

    /// Copy declared output paths back onto the step's base so the step
    /// exports only those paths, whatever its commands touched.
    fn project_outputs(
        &mut self,
        step: &Step,
        outputs: &[String],
        base: LayerId,
        state: LayerId,
    ) -> KeelResult<LayerId> {
        let options = CopyOptions::projection();

        if let [output] = outputs {
            // Single output: avoid the intermediate scratch state.
            return self.sink.copy(
                base,
                state,
                output,
                output,
                &options,
                Some(&format!("copying {output}")),
            );
        }

        let mut collected = self.sink.scratch()?;
        for output in outputs {
            collected = self.sink.copy(
                collected,
                state,
                output,
                output,
                &options,
                Some(&format!("copying {output}")),
            )?;
        }
        self.sink.copy(
            base,
            collected,
            "/",
            "/",
            &CopyOptions::merge(),
            Some(&format!("combined outputs: {}", step.name)),
        )
    }

    fn compile_command(
        &mut self,
        idx: usize,
        step: &Step,
        command: &Command,
        state: LayerId,
    ) -> KeelResult<LayerId> {
        match command {
            Command::Exec { cmd, custom_name } => {
                let argv = vec!["sh".to_string(), "-c".to_string(), cmd.clone()];
                let mut options = RunOptions {
                    cwd: APP_DIR.to_string(),
                    custom_name: custom_name.clone(),
                    ..RunOptions::default()
                };

                if !step.secrets.is_empty() {
                    options.secrets = self.secret_names_for_step(step);
                    if let Some(mount) = self.secrets_hash_mount(step, &options.secrets)? {
                        options.mounts.push(mount);
                    }
                }
                options.caches = self.cache_mounts(&step.caches)?;

                self.sink.run(state, &argv, &options)
            }

            Command::Path { path } => {
                self.nodes[idx].output_env.add_path(path.clone());
                let mut combined = BuildEnvironment::new();
                for entry in &self.nodes[idx].input_env.paths {
                    combined.add_path(entry.clone());
                }
                for entry in &self.nodes[idx].output_env.paths {
                    combined.add_path(entry.clone());
                }
                let value = combined.path_value().unwrap_or_default();
                self.sink.add_env(state, "PATH", &value)
            }

            Command::Copy { image, src, dest } => {
                let source = match image {
                    Some(image) => self.sink.image(image, &self.platform)?,
                    None => self.local_state,
                };
                self.sink
                    .copy(state, source, src, dest, &CopyOptions::projection(), None)
            }

            Command::File {
                name,
                path,
                mode,
                custom_name,
            } => {
                let Some(asset) = step.assets.get(name) else {
                    return Err(KeelError::AssetMissing { name: name.clone() });
                };
                let mut state = state;
                if let Some(parent) = parent_dir(path) {
                    state = self.sink.mkdir(state, &parent, 0o755, true)?;
                }
                self.sink.mkfile(
                    state,
                    path,
                    mode.unwrap_or(0o644),
                    asset.as_bytes(),
                    custom_name.as_deref(),
                )
            }

            Command::Variable { name, value } => {
                self.nodes[idx].output_env.add_var(name.clone(), value.clone());
                self.sink.add_env(state, name, value)
            }

            Command::Spread => {
                tracing::warn!(step = %step.name, "spread marker survived into a frozen plan");
                Ok(state)
            }
        }
    }

    /// Secret names an exec in this step receives, sorted.
    fn secret_names_for_step(&self, step: &Step) -> Vec<String> {
        let mut names = if step.secrets.iter().any(|s| s == "*") {
            self.plan.secrets.clone()
        } else {
            step.secrets.clone()
        };
        names.sort();
        names.dedup();
        names
    }

    /// The secrets-hash mount making an exec's cache key depend on exactly
    /// the secrets it uses.
    fn secrets_hash_mount(
        &mut self,
        step: &Step,
        secret_names: &[String],
    ) -> KeelResult<Option<FileMount>> {
        let Some(hash_file) = self.secrets_hash_file else {
            return Ok(None);
        };

        if step.secrets.iter().any(|s| s == "*") {
            // The global hash already covers every secret.
            return Ok(Some(FileMount {
                path: "/secrets-hash".to_string(),
                source: hash_file,
            }));
        }

        let Some(helper_base) = self.used_secrets_base else {
            return Ok(None);
        };

        // Hash only the used secrets in a throwaway helper chain; the
        // resulting one-line file is what the exec mounts.
        let with_hash = self.sink.copy(
            helper_base,
            hash_file,
            "/secrets-hash",
            "/secrets-hash",
            &CopyOptions::projection(),
            Some("[keel] copy secrets hash"),
        )?;

        let references: Vec<String> = secret_names.iter().map(|name| format!("${name}")).collect();
        let hash_cmd = format!(
            "echo \"{}\" | sha256sum > /used-secrets-hash",
            references.join(" ")
        );
        let hashed = self.sink.run(
            with_hash,
            &["sh".to_string(), "-c".to_string(), hash_cmd],
            &RunOptions {
                cwd: APP_DIR.to_string(),
                secrets: secret_names.to_vec(),
                custom_name: Some("[keel] hash used secrets".to_string()),
                ..RunOptions::default()
            },
        )?;

        let scratch = self.sink.scratch()?;
        let artifact = self.sink.copy(
            scratch,
            hashed,
            "/used-secrets-hash",
            "/used-secrets-hash",
            &CopyOptions::projection(),
            Some("[keel] copy used secrets hash"),
        )?;

        Ok(Some(FileMount {
            path: "/used-secrets-hash".to_string(),
            source: artifact,
        }))
    }

    /// Resolve cache keys to sink mounts.
    fn cache_mounts(&mut self, caches: &[String]) -> KeelResult<Vec<CacheMount>> {
        let mut mounts = Vec::with_capacity(caches.len());
        for key in caches {
            let Some(cache) = self.plan.caches.get(key) else {
                return Err(KeelError::UnknownCache { name: key.clone() });
            };
            mounts.push(self.cache_store.get_cache(key, cache));
        }
        Ok(mounts)
    }

    /// Merge node states by copying each rootfs onto a scratch layer,
    /// last parent winning on conflicts.
    pub(crate) fn merge_nodes(&mut self, indices: &[usize]) -> KeelResult<LayerId> {
        let mut result = self.sink.scratch()?;
        for &idx in indices {
            let name = self.nodes[idx].step.name.clone();
            let Some(state) = self.nodes[idx].state else {
                return Err(KeelError::DependencyViolation {
                    parent: name,
                    child: "merge".to_string(),
                });
            };
            result = self.sink.copy(
                result,
                state,
                "/",
                "/",
                &CopyOptions::merge(),
                Some(&format!("copy from {name}")),
            )?;
        }
        Ok(result)
    }

}

/// Prefix sink errors with the failing step's name.
fn with_step_context(err: KeelError, step: &str) -> KeelError {
    match err {
        KeelError::BackendError { op, cause } => KeelError::BackendError {
            op: format!("{step}: {op}"),
            cause,
        },
        other => other,
    }
}

/// Parent directory of an absolute path, when it is not the root.
fn parent_dir(path: &str) -> Option<String> {
    let parent = std::path::Path::new(path).parent()?;
    let parent = parent.to_string_lossy();
    if parent.is_empty() || parent == "/" {
        None
    } else {
        Some(parent.to_string())
    }
}
