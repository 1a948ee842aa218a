//! Per-step mutable state used during graph compilation.
//!
//! Nodes live in a flat array; `parents` and `children` are node indices,
//! so cycle checks and ordering stay integer-only.

use keel_core::plan::Step;

use crate::environment::BuildEnvironment;
use crate::sink::LayerId;

#[derive(Debug, Clone)]
pub(crate) struct StepNode {
    /// The frozen step this node compiles.
    pub step: Step,
    /// Parent node indices in dependency-insertion order.
    pub parents: Vec<usize>,
    /// Child node indices.
    pub children: Vec<usize>,
    /// Set once the node's state has been produced.
    pub processed: bool,
    /// Cycle-detection latch while parents are being satisfied.
    pub in_progress: bool,
    /// Environment merged from the parents.
    pub input_env: BuildEnvironment,
    /// Environment this node exports to its children.
    pub output_env: BuildEnvironment,
    /// The produced rootfs, absent until processed.
    pub state: Option<LayerId>,
}

impl StepNode {
    pub(crate) fn new(step: Step) -> Self {
        StepNode {
            step,
            parents: Vec::new(),
            children: Vec::new(),
            processed: false,
            in_progress: false,
            input_env: BuildEnvironment::new(),
            output_env: BuildEnvironment::new(),
            state: None,
        }
    }
}
