//! Common error types for the Keel build planner.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Common errors across plan generation and graph compilation.
#[derive(Error, Diagnostic, Debug)]
pub enum KeelError {
    /// The source tree or a required file could not be read.
    #[error("failed to read {path}: {cause}")]
    #[diagnostic(code(keel::source::unreadable))]
    SourceUnreadable {
        /// Path relative to the source root (or the root itself).
        path: String,
        /// Underlying cause.
        cause: String,
    },

    /// A structured file in the source tree failed to parse.
    #[error("failed to parse {path} as {format}: {cause}")]
    #[diagnostic(code(keel::source::parse))]
    Parse {
        /// Path relative to the source root.
        path: String,
        /// The format that was expected (json, yaml, toml, ...).
        format: String,
        /// Underlying parser error.
        cause: String,
    },

    /// No provider matched the source tree and no provider was configured.
    #[error("could not determine how to build the app")]
    #[diagnostic(
        code(keel::generate::detection_ambiguous),
        help("{help}")
    )]
    DetectionAmbiguous {
        /// Start-command guidance from the default provider.
        help: String,
    },

    /// A tool version could not be resolved.
    #[error("failed to resolve version {constraint} of {tool}: {cause}")]
    #[diagnostic(code(keel::resolver::version))]
    VersionResolution {
        /// The tool being resolved.
        tool: String,
        /// The requested version or constraint.
        constraint: String,
        /// Underlying cause.
        cause: String,
    },

    /// The version service does not know the requested tool.
    #[error("tool `{tool}` is not available from the version service")]
    #[diagnostic(
        code(keel::resolver::unknown_tool),
        help("Try installing `{tool}` as an OS package instead")
    )]
    UnknownTool {
        /// The unknown tool name.
        tool: String,
    },

    /// A step references a cache that is not declared in the plan.
    #[error("cache with key `{name}` not found")]
    #[diagnostic(code(keel::plan::unknown_cache))]
    UnknownCache {
        /// The missing cache key.
        name: String,
    },

    /// A step references a secret that is not declared in the plan.
    #[error("secret `{name}` not found")]
    #[diagnostic(code(keel::plan::unknown_secret))]
    UnknownSecret {
        /// The missing secret name.
        name: String,
    },

    /// A file command references an asset the step does not carry.
    #[error("asset `{name}` not found")]
    #[diagnostic(code(keel::plan::asset_missing))]
    AssetMissing {
        /// The missing asset name.
        name: String,
    },

    /// The step dependency graph contains a cycle.
    #[error("circular dependency between steps: {path}")]
    #[diagnostic(code(keel::graph::cycle))]
    CyclicGraph {
        /// A rendered cycle path, e.g. `a -> b -> a`.
        path: String,
    },

    /// A node consumed a parent whose state was never produced.
    #[error("dependency violation: {child} consumed unprocessed parent {parent}")]
    #[diagnostic(code(keel::graph::dependency_violation))]
    DependencyViolation {
        /// The parent step that had no state.
        parent: String,
        /// The consuming step.
        child: String,
    },

    /// The image-build backend rejected an operation.
    #[error("backend error during {op}: {cause}")]
    #[diagnostic(code(keel::backend))]
    BackendError {
        /// The operation that failed, with step context.
        op: String,
        /// Underlying backend error.
        cause: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keel::io))]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(keel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("internal error: {message}")]
    #[diagnostic(
        code(keel::internal),
        help("This is a bug, please report it at https://github.com/keel-build/keel/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Internal {
            message: format!("serialization error: {err}"),
        }
    }
}

impl KeelError {
    /// Wrap a backend error with step-name context.
    pub fn backend(op: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        KeelError::BackendError {
            op: op.into(),
            cause: cause.to_string(),
        }
    }
}
