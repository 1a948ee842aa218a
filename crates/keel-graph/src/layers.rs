//! Lowering declarative layers to sink states.
//!
//! A layer list materializes either as a native merge (when the layers'
//! include sets are pairwise disjoint) or as sequential copies onto the
//! first layer's state, later layers winning on conflicts.

use keel_common::{KeelError, KeelResult};
use keel_core::plan::Layer;

use crate::graph::{APP_DIR, BuildGraph};
use crate::sink::{CopyOptions, LayerId};

impl BuildGraph<'_> {
    /// The state of a single layer.
    pub(crate) fn state_for_layer(&mut self, layer: &Layer) -> KeelResult<LayerId> {
        match layer {
            Layer::Image { image, .. } => self.sink.image(image, &self.platform),
            Layer::Local { .. } => Ok(self.local_state),
            Layer::Step { step, .. } => match self.index.get(step).copied() {
                Some(idx) => match self.nodes[idx].state {
                    Some(state) => Ok(state),
                    None => self.sink.scratch(),
                },
                None => self.sink.scratch(),
            },
            Layer::Merge { layers } => self.state_for_layers(layers),
            Layer::Scratch | Layer::Spread => self.sink.scratch(),
        }
    }

    /// Materialize a layer list: the first layer is the base and must carry
    /// no filter; later layers contribute their include paths.
    ///
    /// # Errors
    ///
    /// Config error when the first layer is filtered; sink failures.
    pub fn state_for_layers(&mut self, layers: &[Layer]) -> KeelResult<LayerId> {
        let Some(first) = layers.first() else {
            return self.sink.scratch();
        };

        if first.filter().is_some_and(|filter| !filter.is_empty()) {
            return Err(KeelError::Config {
                message: "first input must not have include or exclude paths".to_string(),
            });
        }

        let base = self.state_for_layer(first)?;
        if layers.len() == 1 {
            return Ok(base);
        }

        if should_merge_layers(layers) {
            self.merge_layer_states(base, layers)
        } else {
            self.copy_layer_states(base, layers)
        }
    }

    /// Copy fallback: apply each layer's include paths onto the base.
    fn copy_layer_states(&mut self, base: LayerId, layers: &[Layer]) -> KeelResult<LayerId> {
        let mut state = base;
        for layer in &layers[1..] {
            let source = self.state_for_layer(layer)?;
            state = self.copy_layer_paths(state, source, layer)?;
        }
        Ok(state)
    }

    /// Native-merge path: project each layer onto scratch, then merge.
    fn merge_layer_states(&mut self, base: LayerId, layers: &[Layer]) -> KeelResult<LayerId> {
        let mut states = vec![base];
        let mut names = vec![layers[0].display_name()];

        for layer in &layers[1..] {
            if layer.filter().is_none_or(|filter| filter.include.is_empty()) {
                tracing::warn!(layer = %layer.display_name(), "merged layer has no include paths");
            }
            let source = self.state_for_layer(layer)?;
            let scratch = self.sink.scratch()?;
            let projected = self.copy_layer_paths(scratch, source, layer)?;
            states.push(projected);
            names.push(layer.display_name());
        }

        self.sink
            .merge(&states, Some(&format!("[keel] merge {}", names.join(", "))))
    }

    /// Copy a layer's include paths from `source` onto `dest`.
    fn copy_layer_paths(
        &mut self,
        dest: LayerId,
        source: LayerId,
        layer: &Layer,
    ) -> KeelResult<LayerId> {
        let Some(filter) = layer.filter() else {
            // No filter on the variant: take the entire layer.
            return self
                .sink
                .copy(dest, source, "/", "/", &CopyOptions::merge(), None);
        };

        let is_local = matches!(layer, Layer::Local { .. });
        let mut state = dest;
        for include in &filter.include {
            let (src_path, dest_path) = if is_local {
                // Local paths land under the app directory.
                (
                    include.clone(),
                    join_app_path(std::path::Path::new(include).file_name().map_or(
                        include.as_str(),
                        |name| name.to_str().unwrap_or(include.as_str()),
                    )),
                )
            } else {
                resolve_paths(include)
            };

            let options = CopyOptions {
                copy_dir_contents: true,
                exclude_patterns: filter.exclude.clone(),
                ..CopyOptions::projection()
            };
            let name = (src_path == dest_path).then(|| format!("copy {src_path}"));
            state = self
                .sink
                .copy(state, source, &src_path, &dest_path, &options, name.as_deref())?;
        }
        Ok(state)
    }
}

/// Whether a layer list can use the native merge: true iff no two layers
/// share an include path.
#[must_use]
pub fn should_merge_layers(layers: &[Layer]) -> bool {
    for (i, layer) in layers.iter().enumerate() {
        for other in &layers[i + 1..] {
            let a = layer.filter().map(|f| f.include.as_slice()).unwrap_or(&[]);
            let b = other.filter().map(|f| f.include.as_slice()).unwrap_or(&[]);
            if has_path_overlap(a, b) {
                return false;
            }
        }
    }
    true
}

/// Whether two include sets share a path. Compared as strings, with `.`
/// equal to the app directory.
#[must_use]
pub fn has_path_overlap(paths1: &[String], paths2: &[String]) -> bool {
    paths1.iter().any(|p1| {
        let p1 = normalize_include(p1);
        paths2.iter().any(|p2| normalize_include(p2) == p1)
    })
}

fn normalize_include(path: &str) -> &str {
    match path {
        "." | "/app/" | "/app" => APP_DIR,
        other => other.trim_end_matches('/'),
    }
}

/// Source and destination paths for a non-local include entry.
fn resolve_paths(include: &str) -> (String, String) {
    match include {
        "." | "/app" | "/app/" => (APP_DIR.to_string(), APP_DIR.to_string()),
        path if path.starts_with('/') => (path.to_string(), path.to_string()),
        relative => {
            let joined = join_app_path(relative);
            (joined.clone(), joined)
        }
    }
}

fn join_app_path(path: &str) -> String {
    if path == "." || path.is_empty() {
        APP_DIR.to_string()
    } else {
        format!("{APP_DIR}/{}", path.trim_start_matches('/'))
    }
}
