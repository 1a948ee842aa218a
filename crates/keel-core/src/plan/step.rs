//! Steps and the commands they run.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use super::layer::Layer;

/// A single build instruction inside a step.
///
/// The JSON form discriminates on the fields present: `cmd` is an exec,
/// `src`+`dest` a copy, `name`+`value` a variable, `name`+`path` a file
/// materialization and a bare `path` prepends to `PATH`. A plain string is
/// an exec command; the string `"..."` is the config spread marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a shell command in the current rootfs.
    Exec {
        /// The command line, parsed with shell lexing.
        cmd: String,
        /// Optional display name for the operation.
        custom_name: Option<String>,
    },

    /// Prepend a directory to `PATH` for this step and its descendants.
    Path {
        /// The directory to prepend.
        path: String,
    },

    /// Copy from an image or the local context into the rootfs.
    Copy {
        /// Source image; the local source tree when absent.
        image: Option<String>,
        /// Source path.
        src: String,
        /// Destination path.
        dest: String,
    },

    /// Materialize an inline asset as a file.
    File {
        /// Key into the step's asset map.
        name: String,
        /// Destination path of the file.
        path: String,
        /// File mode; defaults to `0o644`.
        mode: Option<u32>,
        /// Optional display name for the operation.
        custom_name: Option<String>,
    },

    /// Set an environment variable in the rootfs.
    Variable {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },

    /// Spread marker: replaced by the existing command sequence when user
    /// config is merged over generated steps. Never present in a final plan.
    Spread,
}

impl Command {
    /// An exec command.
    #[must_use]
    pub fn exec(cmd: impl Into<String>) -> Self {
        Command::Exec {
            cmd: cmd.into(),
            custom_name: None,
        }
    }

    /// An exec command with a display name.
    #[must_use]
    pub fn exec_named(cmd: impl Into<String>, custom_name: impl Into<String>) -> Self {
        Command::Exec {
            cmd: cmd.into(),
            custom_name: Some(custom_name.into()),
        }
    }

    /// A `PATH` prepend command.
    #[must_use]
    pub fn path(path: impl Into<String>) -> Self {
        Command::Path { path: path.into() }
    }

    /// Copy `src` from the local context to the same path in the rootfs.
    #[must_use]
    pub fn copy(src: impl Into<String>) -> Self {
        let src = src.into();
        let dest = src.clone();
        Command::Copy {
            image: None,
            src,
            dest,
        }
    }

    /// Copy from the local context with distinct source and destination.
    #[must_use]
    pub fn copy_to(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Command::Copy {
            image: None,
            src: src.into(),
            dest: dest.into(),
        }
    }

    /// Materialize an asset at `path`.
    #[must_use]
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Command::File {
            name: name.into(),
            path: path.into(),
            mode: None,
            custom_name: None,
        }
    }

    /// Set a variable.
    #[must_use]
    pub fn variable(name: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Variable {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Command::Exec { cmd, custom_name } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("cmd", cmd)?;
                if let Some(name) = custom_name {
                    map.serialize_entry("customName", name)?;
                }
                map.end()
            }
            Command::Path { path } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("path", path)?;
                map.end()
            }
            Command::Copy { image, src, dest } => {
                let mut map = serializer.serialize_map(None)?;
                if let Some(image) = image {
                    map.serialize_entry("image", image)?;
                }
                map.serialize_entry("src", src)?;
                map.serialize_entry("dest", dest)?;
                map.end()
            }
            Command::File {
                name,
                path,
                mode,
                custom_name,
            } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("path", path)?;
                if let Some(mode) = mode {
                    map.serialize_entry("mode", mode)?;
                }
                if let Some(custom) = custom_name {
                    map.serialize_entry("customName", custom)?;
                }
                map.end()
            }
            Command::Variable { name, value } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            Command::Spread => serializer.serialize_str("..."),
        }
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CommandVisitor)
    }
}

struct CommandVisitor;

impl<'de> Visitor<'de> for CommandVisitor {
    type Value = Command;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a command object or a shell command string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Command, E> {
        if value == "..." {
            Ok(Command::Spread)
        } else {
            Ok(Command::exec(value))
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Command, A::Error> {
        let mut cmd: Option<String> = None;
        let mut image: Option<String> = None;
        let mut src: Option<String> = None;
        let mut dest: Option<String> = None;
        let mut name: Option<String> = None;
        let mut path: Option<String> = None;
        let mut value: Option<String> = None;
        let mut mode: Option<u32> = None;
        let mut custom_name: Option<String> = None;

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "cmd" => cmd = Some(access.next_value()?),
                "image" => image = Some(access.next_value()?),
                "src" => src = Some(access.next_value()?),
                "dest" => dest = Some(access.next_value()?),
                "name" => name = Some(access.next_value()?),
                "path" => path = Some(access.next_value()?),
                "value" => value = Some(access.next_value()?),
                "mode" => mode = Some(access.next_value()?),
                "customName" => custom_name = Some(access.next_value()?),
                other => {
                    return Err(de::Error::unknown_field(
                        other,
                        &["cmd", "image", "src", "dest", "name", "path", "value", "mode", "customName"],
                    ));
                }
            }
        }

        if let Some(cmd) = cmd {
            Ok(Command::Exec { cmd, custom_name })
        } else if let (Some(src), Some(dest)) = (src.clone(), dest.clone()) {
            Ok(Command::Copy { image, src, dest })
        } else if let (Some(name), Some(value)) = (name.clone(), value.clone()) {
            Ok(Command::Variable { name, value })
        } else if let (Some(name), Some(path)) = (name, path.clone()) {
            Ok(Command::File {
                name,
                path,
                mode,
                custom_name,
            })
        } else if let Some(path) = path {
            Ok(Command::Path { path })
        } else {
            Err(de::Error::custom("object does not match any command shape"))
        }
    }
}

impl JsonSchema for Command {
    fn schema_name() -> Cow<'static, str> {
        "Command".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "description": "A build instruction: exec (cmd), copy (src/dest), variable (name/value), file (name/path) or PATH prepend (path). A plain string is an exec command.",
            "anyOf": [
                { "type": "string" },
                {
                    "type": "object",
                    "properties": {
                        "cmd": { "type": "string" },
                        "image": { "type": "string" },
                        "src": { "type": "string" },
                        "dest": { "type": "string" },
                        "name": { "type": "string" },
                        "path": { "type": "string" },
                        "value": { "type": "string" },
                        "mode": { "type": "integer" },
                        "customName": { "type": "string" }
                    },
                    "additionalProperties": false
                }
            ]
        })
    }
}

/// A unit of rootfs transformation in the build plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique step name; sub-contexts are embedded with `:` separators.
    pub name: String,

    /// Layers this step builds on. The first layer must carry no filter and
    /// is the base the commands run over; later layers contribute files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Layer>,

    /// Commands executed in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,

    /// Environment variables available to this step and its descendants.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Names of caches from the plan to mount into exec commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<String>,

    /// Secrets exposed to exec commands; `["*"]` means all declared secrets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Inline assets referenced by file commands.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, String>,

    /// When set, only these paths (projected onto the step's base) are the
    /// observable result of the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    /// Run atop this image instead of the parents' merged state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_image: Option<String>,

    /// Explicit ordering dependencies beyond layer inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    /// Create an empty step with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            ..Step::default()
        }
    }

    /// Append commands to the step.
    pub fn add_commands(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    /// Names of all steps referenced by this step's inputs and
    /// `depends_on` list.
    #[must_use]
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        for input in &self.inputs {
            input.collect_step_refs(&mut refs);
        }
        for dep in &self.depends_on {
            refs.push(dep.as_str());
        }
        refs
    }
}
