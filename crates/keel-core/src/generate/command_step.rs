//! Builder for command steps, the workhorse step kind providers emit.

use std::collections::BTreeMap;

use crate::app::Environment;
use crate::plan::{Command, Layer, Step};

/// Accumulates a step's inputs, commands, variables, caches and secrets
/// before it is frozen into the plan.
#[derive(Debug, Clone)]
pub struct CommandStepBuilder {
    name: String,
    /// Layers the step builds on.
    pub inputs: Vec<Layer>,
    /// Commands executed in order.
    pub commands: Vec<Command>,
    /// Environment variables for the step and its descendants.
    pub variables: BTreeMap<String, String>,
    /// Cache keys mounted into exec commands.
    pub caches: Vec<String>,
    /// Secrets exposed to exec commands; defaults to all (`["*"]`).
    pub secrets: Vec<String>,
    /// Inline assets for file commands.
    pub assets: BTreeMap<String, String>,
    /// Declared output paths.
    pub outputs: Option<Vec<String>>,
    /// Explicit ordering dependencies.
    pub depends_on: Vec<String>,
    /// Image to run atop instead of the parents' merged state.
    pub starting_image: Option<String>,
}

impl CommandStepBuilder {
    /// Create a builder for a step with the given (already scoped) name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        CommandStepBuilder {
            name: name.into(),
            inputs: Vec::new(),
            commands: Vec::new(),
            variables: BTreeMap::new(),
            caches: Vec::new(),
            secrets: vec!["*".to_string()],
            assets: BTreeMap::new(),
            outputs: None,
            depends_on: Vec::new(),
            starting_image: None,
        }
    }

    /// The step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an input layer.
    pub fn add_input(&mut self, input: Layer) {
        self.inputs.push(input);
    }

    /// Append a command.
    pub fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Append commands in order.
    pub fn add_commands(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    /// Merge variables over the step's variables.
    pub fn add_variables<K: Into<String>, V: Into<String>>(
        &mut self,
        variables: impl IntoIterator<Item = (K, V)>,
    ) {
        for (key, value) in variables {
            self.variables.insert(key.into(), value.into());
        }
    }

    /// Reference a registered cache.
    pub fn add_cache(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name.is_empty() {
            tracing::error!("cache name is empty");
            return;
        }
        self.caches.push(name);
    }

    /// Prepend directories to `PATH` via path commands.
    pub fn add_paths<S: Into<String>>(&mut self, paths: impl IntoIterator<Item = S>) {
        for path in paths {
            self.commands.push(Command::path(path));
        }
    }

    /// Expose exactly the environment's variables starting with any of the
    /// given prefixes, instead of all secrets.
    pub fn use_secrets_with_prefixes<S: AsRef<str>>(
        &mut self,
        env: &Environment,
        prefixes: impl IntoIterator<Item = S>,
    ) {
        self.secrets.retain(|s| s != "*");
        for prefix in prefixes {
            self.secrets.extend(env.secrets_with_prefix(prefix.as_ref()));
        }
    }

    /// Freeze the builder into a plan step.
    #[must_use]
    pub fn build(&self) -> Step {
        Step {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            commands: self.commands.clone(),
            variables: self.variables.clone(),
            caches: self.caches.clone(),
            secrets: self.secrets.clone(),
            assets: self.assets.clone(),
            outputs: self.outputs.clone(),
            starting_image: self.starting_image.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}
