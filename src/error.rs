//! Error taxonomy for the orchestrator.
//!
//! Every failure that can surface to a user maps to one of the kinds below.
//! Unit-scoped errors are collected into the end-of-run report; fatal errors
//! (cycles, invalid flag combinations) abort the whole run.

use std::path::PathBuf;

/// Result type for orchestrator operations.
pub type StratusResult<T> = Result<T, StratusError>;

/// Errors raised by the orchestrator core.
#[derive(Debug, thiserror::Error)]
pub enum StratusError {
    #[error("failed to parse {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("failed to evaluate {}: {message}", path.display())]
    ConfigEval { path: PathBuf, message: String },

    #[error("dependency cycle detected: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("failed to fetch source {source_desc}: {message}")]
    SourceFetch {
        source_desc: String,
        message: String,
    },

    #[error("cannot resolve outputs of dependency {dependency}: {message}")]
    DependencyOutput { dependency: String, message: String },

    #[error("generate target {} already exists and is not replaceable", target.display())]
    GenerateConflict { target: PathBuf },

    #[error("{program} exited with code {code}")]
    ExternalCommand {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("authentication via {method} failed: {message}")]
    Auth { method: String, message: String },

    #[error("backend {backend}: {message}")]
    Backend { backend: String, message: String },

    #[error("cancelled before completion")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The kind of an error, used for reporting and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigParse,
    ConfigEval,
    Cycle,
    SourceFetch,
    DependencyOutput,
    GenerateConflict,
    ExternalCommand,
    Auth,
    Backend,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Short name used in the end-of-run summary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigParse => "ConfigParseError",
            Self::ConfigEval => "ConfigEvalError",
            Self::Cycle => "CycleError",
            Self::SourceFetch => "SourceFetchError",
            Self::DependencyOutput => "DependencyOutputError",
            Self::GenerateConflict => "GenerateConflictError",
            Self::ExternalCommand => "ExternalCommandError",
            Self::Auth => "AuthError",
            Self::Backend => "BackendError",
            Self::Cancelled => "CancelledError",
            Self::Io => "IoError",
        }
    }

    /// Fatal errors abort the whole run instead of failing a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Cycle)
    }
}

impl StratusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigParse { .. } => ErrorKind::ConfigParse,
            Self::ConfigEval { .. } => ErrorKind::ConfigEval,
            Self::Cycle { .. } => ErrorKind::Cycle,
            Self::SourceFetch { .. } => ErrorKind::SourceFetch,
            Self::DependencyOutput { .. } => ErrorKind::DependencyOutput,
            Self::GenerateConflict { .. } => ErrorKind::GenerateConflict,
            Self::ExternalCommand { .. } => ErrorKind::ExternalCommand,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Convenience constructor for parse failures.
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for evaluation failures.
    pub fn eval(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigEval {
            path: path.into(),
            message: message.into(),
        }
    }
}
