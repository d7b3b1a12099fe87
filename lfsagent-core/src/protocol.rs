//! Control protocol messages
//!
//! The host tool talks to the agent with one JSON object per line. Requests
//! are tagged by their `event` field; any tag not listed in [`Request`] is
//! rejected when the line is parsed.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A request from the host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Request {
    Init(InitRequest),
    Upload(UploadRequest),
    Download(DownloadRequest),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitRequest {
    /// `upload` or `download`
    #[serde(default)]
    pub operation: Option<String>,
    /// Remote name, URL or path
    pub remote: String,
    #[serde(default)]
    pub concurrent: Option<bool>,
    #[serde(default)]
    pub concurrenttransfers: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadRequest {
    pub oid: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadRequest {
    pub oid: String,
    pub size: u64,
}

/// Error payload of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

impl From<&AgentError> for WireError {
    fn from(err: &AgentError) -> Self {
        Self {
            code: err.code().as_i32(),
            message: err.to_string(),
        }
    }
}

/// Reply to `init`: `{}` on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl InitResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(err: &AgentError) -> Self {
        Self {
            error: Some(err.into()),
        }
    }
}

/// Per-object event sent while serving upload and download requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Progress {
        oid: String,
        #[serde(rename = "bytesSoFar")]
        bytes_so_far: u64,
        #[serde(rename = "bytesSinceLast")]
        bytes_since_last: u64,
    },
    Complete {
        oid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

impl Event {
    /// Single progress event covering the whole object
    pub fn progress_done(oid: &str, size: u64) -> Self {
        Event::Progress {
            oid: oid.to_string(),
            bytes_so_far: size,
            bytes_since_last: size,
        }
    }

    pub fn complete(oid: &str, path: Option<PathBuf>) -> Self {
        Event::Complete {
            oid: oid.to_string(),
            path,
            error: None,
        }
    }

    pub fn failed(oid: &str, err: &AgentError) -> Self {
        Event::Complete {
            oid: oid.to_string(),
            path: None,
            error: Some(err.into()),
        }
    }
}

/// Parse one request line
pub fn parse_request(line: &str) -> Result<Request> {
    serde_json::from_str(line).map_err(|e| AgentError::Protocol(format!("bad request {:?}: {}", line, e)))
}

/// Encode a response as a single line, newline included
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line =
        serde_json::to_string(message).map_err(|e| AgentError::Protocol(format!("cannot encode response: {}", e)))?;
    line.push('\n');
    Ok(line)
}
