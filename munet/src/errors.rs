//! Error taxonomy for the topology engine.
//!
//! Validation and planning errors surface before any kernel mutation;
//! bring-up errors trigger rollback and then surface; teardown never fails,
//! it only logs. Each error kind maps onto the driver's exit code.

use std::io;

use crate::command;

/// A validation failure pointed at the config location that caused it,
/// e.g. `topology.nodes[2].connections[0].ip`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PathError {
    pub path: String,
    pub message: String,
}

impl PathError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no config file found for {0:?} (tried .json, .yaml, .toml)")]
    ConfigNotFound(String),

    #[error("invalid config: {}", format_path_errors(.0))]
    ConfigInvalid(Vec<PathError>),

    #[error("node {node}: unknown kind {kind:?}")]
    UnknownKind { node: String, kind: String },

    #[error("name {0:?} is used more than once")]
    NameCollision(String),

    #[error("network {network}: address space {cidr} exhausted")]
    AddressExhausted { network: String, cidr: String },

    #[error("ambiguous p2p link between {a} and {b}: {detail}")]
    P2PAmbiguous { a: String, b: String, detail: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("node {node}: interface {ifname} already exists")]
    LinkExists { node: String, ifname: String },

    #[error("node {node}: interface {ifname} not found")]
    IfaceNotFound { node: String, ifname: String },

    #[error("node {node}: failed to start: {detail}")]
    StartFailed { node: String, detail: String },

    #[error("node {node}: exec failed: {detail}")]
    ExecFailed { node: String, detail: String },

    #[error("node {0} is not running")]
    NotRunning(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Command(#[from] command::CommandError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable name of the error kind, for the driver's summary line.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::ConfigNotFound(_) => "ConfigNotFound",
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::UnknownKind { .. } => "UnknownKind",
            Error::NameCollision(_) => "NameCollision",
            Error::AddressExhausted { .. } => "AddressExhausted",
            Error::P2PAmbiguous { .. } => "P2PAmbiguous",
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::LinkExists { .. } => "LinkExists",
            Error::IfaceNotFound { .. } => "IfaceNotFound",
            Error::StartFailed { .. } => "StartFailed",
            Error::ExecFailed { .. } => "ExecFailed",
            Error::NotRunning(_) => "NotRunning",
            Error::Cancelled => "Cancelled",
            Error::Internal(_) => "Internal",
            Error::Io(_) => "Io",
            Error::Command(_) => "Command",
        }
    }

    /// The driver exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigNotFound(_)
            | Error::UnknownKind { .. }
            | Error::NameCollision(_)
            | Error::AddressExhausted { .. }
            | Error::P2PAmbiguous { .. } => 2,
            Error::ConfigInvalid(_) => 3,
            Error::PermissionDenied(_) => 4,
            Error::BackendUnavailable(_) => 5,
            Error::Cancelled => 130,
            Error::LinkExists { .. }
            | Error::IfaceNotFound { .. }
            | Error::StartFailed { .. }
            | Error::ExecFailed { .. }
            | Error::NotRunning(_)
            | Error::Internal(_)
            | Error::Io(_)
            | Error::Command(_) => 6,
        }
    }
}

fn format_path_errors(errors: &[PathError]) -> String {
    errors.iter().map(PathError::to_string).collect::<Vec<_>>().join("; ")
}
