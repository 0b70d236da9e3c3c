//! Error types of the manager core.

use rtkit_bus::BusError;

/// Errors surfaced by the schema tree, the configuration tree and the
/// commit engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad schema or configuration syntax. The tree is left untouched.
    #[error("{source_hint}:{line}: {message}")]
    Parse {
        source_hint: String,
        line: u32,
        message: String,
    },

    /// A mutation was rejected because it violates the schema.
    #[error("schema violation at '{path}': {message}")]
    SchemaViolation { path: String, message: String },

    /// A `$(…)` reference did not resolve during action expansion.
    #[error("unresolved variable '{name}'")]
    UnresolvedVariable { name: String },

    /// The module dependency graph has a cycle.
    #[error("module dependency cycle involving: {}", modules.join(", "))]
    DependencyCycle { modules: Vec<String> },

    /// Another commit is already running.
    #[error("commit already in progress")]
    CommitInProgress,

    /// The node is locked by another user.
    #[error("node '{path}' is locked by user {holder}")]
    NodeLocked { path: String, holder: u32 },

    /// A commit failed; `message` is the first fatal error, prefixed with
    /// the module it struck.
    #[error("commit failed: [{module}] {message}")]
    Commit { module: String, message: String },

    /// A child process could not be spawned or exited in a required step.
    #[error("process failure in module '{module}': {message}")]
    Process { module: String, message: String },

    /// A bus error surfaced outside the retry machinery.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A configuration file could not be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn parse(source_hint: &str, line: u32, message: impl Into<String>) -> Self {
        Error::Parse {
            source_hint: source_hint.to_owned(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SchemaViolation {
            path: path.into(),
            message: message.into(),
        }
    }
}
