//! Transports move objects between the host's working copy and a store.
//!
//! A transport is produced once by `init` and used unchanged for every later
//! request of the session.

mod local;
mod ssh;

pub use local::{LocalConnector, LocalTransport};
pub use ssh::{SshConnector, SshEndpoint, SshTransport, parse_ssh_url};

use crate::config::{ConfigResolver, Scope, keys};
use crate::error::{AgentError, Result};
use crate::object::Oid;
use crate::protocol::InitRequest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Moves single objects in and out of a store
#[async_trait]
pub trait Transport: Send + Sync {
    /// Store the content at `path` as `oid`
    async fn upload(&self, oid: &Oid, size: u64, path: &Path) -> Result<()>;

    /// Fetch `oid` into a fresh local file and return its path
    async fn download(&self, oid: &Oid, size: u64) -> Result<PathBuf>;
}

/// Builds the session transport from an `init` request
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, init: &InitRequest) -> Result<Box<dyn Transport>>;
}

/// Resolve the `remote` argument of `init` to a URL or path.
///
/// Absolute paths and URLs are used literally; anything else is looked up as
/// a remote name, falling back to the literal value when no such remote is
/// configured.
pub fn resolve_remote(config: &dyn ConfigResolver, remote: &str) -> Result<String> {
    if remote.is_empty() {
        return Err(AgentError::Protocol("init request names no remote".to_string()));
    }
    if remote.starts_with('/') || remote.contains("://") {
        return Ok(remote.to_string());
    }
    Ok(config
        .get(&keys::remote_url(remote), &Scope::Current)?
        .unwrap_or_else(|| remote.to_string()))
}

/// Reject a source whose size differs from what the host announced
fn check_source_size(path: &Path, size: u64) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| AgentError::path(path, format!("cannot read source: {}", e)))?;
    if !meta.is_file() {
        return Err(AgentError::path(path, "source is not a regular file"));
    }
    if meta.len() != size {
        return Err(AgentError::path(
            path,
            format!("source has {} bytes, expected {}", meta.len(), size),
        ));
    }
    Ok(())
}

/// Run filesystem work on the blocking thread pool
async fn run_blocking<T, F>(path: &Path, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AgentError::path(path, format!("transfer task failed: {:?}", e)))?
}
