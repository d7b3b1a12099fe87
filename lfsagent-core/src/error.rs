//! Error kinds for transfer operations
//!
//! Every failure inside the agent is an [`AgentError`]. The numeric
//! [`ErrorCode`] is only attached when an error crosses the control
//! protocol boundary.

use std::path::PathBuf;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Numeric codes surfaced in the `error.code` field of protocol responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Config = 1,
    UrlFormat = 2,
    Path = 3,
    Link = 4,
    Copy = 5,
    Directory = 6,
    PreUpload = 7,
    PreDownload = 8,
    Upload = 9,
    Download = 10,
    Protocol = 11,
}

impl ErrorCode {
    /// Wire value of the code
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Failure while looking up configuration or repository paths
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config lookup for '{key}' failed: {message}")]
    Lookup { key: String, message: String },

    #[error("invalid value for '{key}': {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("cannot resolve repository path: {0}")]
    RepoPath(String),
}

/// Failure of an externally invoked command (remote shell or bulk copy)
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to run {program} for {host}: {source}")]
    Spawn {
        host: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} on {host} exited with {status}: {output}")]
    Failed {
        host: String,
        command: String,
        status: String,
        output: String,
    },
}

impl RemoteError {
    /// Captured diagnostic output of the failed command, if any
    pub fn output(&self) -> &str {
        match self {
            RemoteError::Spawn { .. } => "",
            RemoteError::Failed { output, .. } => output,
        }
    }
}

/// Errors that can occur while serving transfer requests
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid remote URL {url:?}: expected ssh://<host>//<absolute-path>")]
    UrlFormat { url: String },

    #[error("{}: {reason}", path.display())]
    Path { path: PathBuf, reason: String },

    #[error("invalid object id {0:?}")]
    InvalidOid(String),

    #[error("object {oid} not found in {}", store.display())]
    MissingObject { oid: String, store: PathBuf },

    #[error("failed to link {} to {}: {source}", src.display(), dst.display())]
    Link {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {} to {}: {source}", src.display(), dst.display())]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected pre-upload reply from {host}: {output}")]
    PreUpload { host: String, output: String },

    #[error("unexpected pre-download reply from {host}: {output}")]
    PreDownload { host: String, output: String },

    #[error("upload failed: {0}")]
    Upload(#[source] RemoteError),

    #[error("download failed: {0}")]
    Download(#[source] RemoteError),

    #[error("checksum mismatch for {oid}: content hashes to {actual}")]
    ChecksumMismatch { oid: String, actual: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AgentError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Config(_) => ErrorCode::Config,
            AgentError::UrlFormat { .. } => ErrorCode::UrlFormat,
            AgentError::Path { .. }
            | AgentError::InvalidOid(_)
            | AgentError::MissingObject { .. } => ErrorCode::Path,
            AgentError::Link { .. } => ErrorCode::Link,
            AgentError::Copy { .. } => ErrorCode::Copy,
            AgentError::Directory { .. } => ErrorCode::Directory,
            AgentError::PreUpload { .. } => ErrorCode::PreUpload,
            AgentError::PreDownload { .. } => ErrorCode::PreDownload,
            AgentError::Upload(_) | AgentError::ChecksumMismatch { .. } => ErrorCode::Upload,
            AgentError::Download(_) => ErrorCode::Download,
            AgentError::Protocol(_) => ErrorCode::Protocol,
        }
    }

    pub(crate) fn path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AgentError::Path {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn directory(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Directory {
            path: path.into(),
            source,
        }
    }
}
