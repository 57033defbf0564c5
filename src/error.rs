//! Error types for vmesh

use thiserror::Error;

/// Result type alias using the vmesh [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmesh operations.
///
/// `AlreadyExists` doubles as an idempotency signal inside the bridge code:
/// re-adding a port the switch already knows about is not a failure, it is a
/// cue to refresh the port. Errors that cross the mesh are flattened to
/// strings at the wire boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// A named VM, bridge, tap, or host could not be found
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A tap or resource name collision
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    /// Two VMs cannot run together (shared writable disk, duplicate MAC)
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external tool failed; carries the tool's stderr
    #[error("{tool}: {stderr}")]
    External { tool: String, stderr: String },

    /// Mesh send failure or timeout
    #[error("mesh transport error: {0}")]
    Transport(String),

    /// Operation illegal in the VM's current state
    #[error("invalid state: {0}")]
    State(String),

    /// Bad flag, bad unit, malformed input
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem or socket I/O
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire-format parse failure
    #[error("protocol error: {0}")]
    Protocol(#[from] vmesh_protocol::ProtocolError),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn external(tool: impl Into<String>, stderr: impl Into<String>) -> Self {
        Error::External {
            tool: tool.into(),
            stderr: stderr.into(),
        }
    }

    /// True when an external tool reported the resource as already present.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::External { stderr, .. } => stderr.contains("already exists"),
            _ => false,
        }
    }
}
