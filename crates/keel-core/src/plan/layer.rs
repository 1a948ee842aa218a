//! Layers: declarative references to filesystem sources.
//!
//! A layer is exactly one of: an OCI image, the local source tree, another
//! step's output, an empty rootfs, or a union of layers. The JSON form uses
//! the discriminating field as a tag (`image`, `local`, `step`, `scratch`,
//! `merge`) with optional `include`/`exclude` filters alongside, plus three
//! string shorthands: `"."` (the local tree), `"$step-name"` (a step's
//! output) and `"..."` (the spread marker used when merging user config).

use std::borrow::Cow;
use std::fmt;

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Include/exclude globs projecting a subset of a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Filter {
    /// Paths to take from the layer. Empty means the entire layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Patterns excluded from the copied paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl Filter {
    /// A filter that only includes the given paths.
    #[must_use]
    pub fn includes<S: Into<String>>(include: impl IntoIterator<Item = S>) -> Self {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// True when neither include nor exclude entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// A declarative reference to a filesystem source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Base an OCI image.
    Image {
        /// Image reference, e.g. `alpine:3.19`.
        image: String,
        /// Projection filter.
        filter: Filter,
    },

    /// The local source tree.
    Local {
        /// Projection filter.
        filter: Filter,
    },

    /// The output rootfs of a named step.
    Step {
        /// Name of the producing step.
        step: String,
        /// Projection filter.
        filter: Filter,
    },

    /// An empty rootfs.
    Scratch,

    /// Union of layers.
    Merge {
        /// The layers to union, in order.
        layers: Vec<Layer>,
    },

    /// Spread marker: replaced by the existing sequence when user config is
    /// merged over generated steps. Never present in a final plan.
    Spread,
}

impl Layer {
    /// Layer over an image with no filter.
    #[must_use]
    pub fn image(reference: impl Into<String>) -> Self {
        Layer::Image {
            image: reference.into(),
            filter: Filter::default(),
        }
    }

    /// Layer over an image with a filter.
    #[must_use]
    pub fn image_filtered(reference: impl Into<String>, filter: Filter) -> Self {
        Layer::Image {
            image: reference.into(),
            filter,
        }
    }

    /// The whole local source tree.
    #[must_use]
    pub fn local() -> Self {
        Layer::Local {
            filter: Filter::includes(["."]),
        }
    }

    /// The local source tree with a filter.
    #[must_use]
    pub fn local_filtered(filter: Filter) -> Self {
        Layer::Local { filter }
    }

    /// A step's output with no filter.
    #[must_use]
    pub fn step(name: impl Into<String>) -> Self {
        Layer::Step {
            step: name.into(),
            filter: Filter::default(),
        }
    }

    /// A step's output projected through a filter.
    #[must_use]
    pub fn step_filtered(name: impl Into<String>, filter: Filter) -> Self {
        Layer::Step {
            step: name.into(),
            filter,
        }
    }

    /// The filter carried by this layer, if the variant has one.
    #[must_use]
    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Layer::Image { filter, .. } | Layer::Local { filter } | Layer::Step { filter, .. } => {
                Some(filter)
            }
            Layer::Scratch | Layer::Merge { .. } | Layer::Spread => None,
        }
    }

    /// Name of the step this layer references directly, if any.
    #[must_use]
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            Layer::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// All step names referenced by this layer, recursing through merges.
    pub fn collect_step_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Layer::Step { step, .. } => out.push(step),
            Layer::Merge { layers } => {
                for layer in layers {
                    layer.collect_step_refs(out);
                }
            }
            _ => {}
        }
    }

    /// True for a layer that contributes nothing: scratch without a filter,
    /// a merge of nothing, or the spread marker itself.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Layer::Scratch | Layer::Spread => true,
            Layer::Merge { layers } => layers.is_empty(),
            _ => false,
        }
    }

    /// Short human-readable name used for operation labels.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Layer::Image { image, .. } => image.clone(),
            Layer::Local { .. } => "local".to_string(),
            Layer::Step { step, .. } => step.clone(),
            Layer::Scratch => "scratch".to_string(),
            Layer::Merge { layers } => {
                let names: Vec<String> = layers.iter().map(Layer::display_name).collect();
                format!("merge({})", names.join(", "))
            }
            Layer::Spread => "...".to_string(),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Serialize for Layer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Layer::Image { image, filter } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("image", image)?;
                serialize_filter(&mut map, filter)?;
                map.end()
            }
            Layer::Local { filter } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("local", &true)?;
                serialize_filter(&mut map, filter)?;
                map.end()
            }
            Layer::Step { step, filter } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("step", step)?;
                serialize_filter(&mut map, filter)?;
                map.end()
            }
            Layer::Scratch => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("scratch", &true)?;
                map.end()
            }
            Layer::Merge { layers } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("merge", layers)?;
                map.end()
            }
            Layer::Spread => serializer.serialize_str("..."),
        }
    }
}

fn serialize_filter<M: SerializeMap>(map: &mut M, filter: &Filter) -> Result<(), M::Error> {
    if !filter.include.is_empty() {
        map.serialize_entry("include", &filter.include)?;
    }
    if !filter.exclude.is_empty() {
        map.serialize_entry("exclude", &filter.exclude)?;
    }
    Ok(())
}

impl<'de> Deserialize<'de> for Layer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LayerVisitor)
    }
}

struct LayerVisitor;

impl<'de> Visitor<'de> for LayerVisitor {
    type Value = Layer;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a layer object, \".\", \"...\", or \"$step-name\"")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Layer, E> {
        match value {
            "." => Ok(Layer::local()),
            "..." => Ok(Layer::Spread),
            _ => {
                if let Some(step) = value.strip_prefix('$') {
                    Ok(Layer::step(step))
                } else {
                    Err(E::custom(format!(
                        "invalid layer shorthand `{value}`: expected \".\", \"...\", or \"$step-name\""
                    )))
                }
            }
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Layer, A::Error> {
        let mut image: Option<String> = None;
        let mut local: Option<bool> = None;
        let mut step: Option<String> = None;
        let mut scratch: Option<bool> = None;
        let mut merge: Option<Vec<Layer>> = None;
        let mut filter = Filter::default();

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "image" => image = Some(access.next_value()?),
                "local" => local = Some(access.next_value()?),
                "step" => step = Some(access.next_value()?),
                "scratch" => scratch = Some(access.next_value()?),
                "merge" => merge = Some(access.next_value()?),
                "include" => filter.include = access.next_value()?,
                "exclude" => filter.exclude = access.next_value()?,
                other => {
                    return Err(de::Error::unknown_field(
                        other,
                        &["image", "local", "step", "scratch", "merge", "include", "exclude"],
                    ));
                }
            }
        }

        let tags = usize::from(image.is_some())
            + usize::from(local.unwrap_or(false))
            + usize::from(step.is_some())
            + usize::from(scratch.unwrap_or(false))
            + usize::from(merge.is_some());
        if tags > 1 {
            return Err(de::Error::custom(
                "layer must have exactly one of image, local, step, scratch, merge",
            ));
        }

        if let Some(image) = image {
            Ok(Layer::Image { image, filter })
        } else if local.unwrap_or(false) {
            Ok(Layer::Local { filter })
        } else if let Some(step) = step {
            Ok(Layer::Step { step, filter })
        } else if let Some(layers) = merge {
            Ok(Layer::Merge { layers })
        } else {
            Ok(Layer::Scratch)
        }
    }
}

impl JsonSchema for Layer {
    fn schema_name() -> Cow<'static, str> {
        "Layer".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "description": "A filesystem layer: an image, the local source tree, a step output, scratch, or a merge. Strings \".\", \"...\" and \"$step-name\" are shorthands.",
            "anyOf": [
                { "type": "string" },
                {
                    "type": "object",
                    "properties": {
                        "image": { "type": "string" },
                        "local": { "type": "boolean" },
                        "step": { "type": "string" },
                        "scratch": { "type": "boolean" },
                        "merge": { "type": "array" },
                        "include": { "type": "array", "items": { "type": "string" } },
                        "exclude": { "type": "array", "items": { "type": "string" } }
                    },
                    "additionalProperties": false
                }
            ]
        })
    }
}
