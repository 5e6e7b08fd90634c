//! Error taxonomy for the class compiler.
//!
//! Per-class problems (`ParseError`, `CompileFailure`) are isolated and never
//! abort a batch. Configuration and library problems bubble up to the
//! top-level run through `CompilerError`.

use std::path::PathBuf;
use thiserror::Error;

/// A single source file failed structural extraction.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Syntax error in {file}: {message}")]
    Syntax { file: String, message: String },

    #[error("No class, mixin or interface definition found in {file}")]
    NoDefinition { file: String },

    #[error("Invalid definition in {file}: {message}")]
    InvalidDefinition { file: String, message: String },
}

/// Failures of the on-disk metadata store.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Metadata I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt metadata in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Unknown source file {0:?}")]
    UnknownFile(PathBuf),
}

/// User-facing configuration problems; always fatal to the current run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("No targets are configured")]
    NoTargets,

    #[error("Target \"{0}\" has no output path")]
    MissingOutputPath(String),

    #[error("Both \"{0}\" and \"{1}\" are marked as the default application")]
    DuplicateDefaultApplication(String, String),

    #[error("Application \"{0}\" is defined more than once")]
    DuplicateApplication(String),

    #[error("Application \"{0}\" has no class")]
    MissingApplicationClass(String),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Cannot find Manifest.json in {0:?}")]
    MissingManifest(PathBuf),

    #[error("Invalid manifest {path:?}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Library \"{library}\" is required by \"{required_by}\" but was not loaded")]
    UnresolvedLibrary {
        library: String,
        required_by: String,
    },

    #[error("Two libraries provide the namespace \"{0}\"")]
    DuplicateNamespace(String),

    #[error("Cannot read configuration {path:?}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// A required library's version does not satisfy a declared range.
#[derive(Debug, Clone, Error)]
#[error("Library \"{library}\" version {actual} does not satisfy \"{requirement}\" (required by \"{required_by}\")")]
pub struct DependencyVersionError {
    pub library: String,
    pub required_by: String,
    pub requirement: String,
    pub actual: String,
}

/// A string-keyed registry lookup failed.
#[derive(Debug, Clone, Error)]
#[error("Unknown {kind} \"{name}\"")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub name: String,
}

impl NotFoundError {
    pub fn new(kind: &'static str, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// Per-class compile failure. Cloneable so that every caller coalesced onto
/// the same in-flight compile receives the same outcome.
#[derive(Debug, Clone, Error)]
#[error("Failed to compile {classname}: {message}")]
pub struct CompileFailure {
    pub classname: String,
    pub message: String,
}

impl CompileFailure {
    pub fn new(classname: &str, message: impl Into<String>) -> Self {
        Self {
            classname: classname.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Cannot add watch root {0:?} after discovery has started")]
    AlreadyStarted(PathBuf),

    #[error("Watch root {0:?} does not exist")]
    MissingRoot(PathBuf),

    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Cannot stat {path:?}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("callAll requires every worker to be idle ({busy} busy)")]
    WorkersBusy { busy: usize },

    #[error("Worker {worker} failed in {method}: {message}")]
    Method {
        worker: usize,
        method: String,
        message: String,
    },

    #[error("Worker pool has shut down")]
    Closed,

    #[error("Cannot broadcast metadata snapshot: {0}")]
    Snapshot(String),
}

#[derive(Debug, Error)]
pub enum MakerError {
    #[error("Output error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Compile(#[from] CompileFailure),

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MakerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MakerError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Top-level failure of a compiler run.
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{} library version requirement(s) failed", .0.len())]
    DependencyVersions(Vec<DependencyVersionError>),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Maker(#[from] MakerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Compiler server error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
