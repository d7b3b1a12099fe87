//! Transport into an object store on a locally mounted filesystem

use super::{Connector, Transport, check_source_size, resolve_remote, run_blocking};
use crate::config::{ConfigResolver, RepoPathKind, Scope, is_shared_value, keys};
use crate::error::{AgentError, Result};
use crate::object::Oid;
use crate::protocol::InitRequest;
use crate::store::ObjectStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a [`LocalTransport`] for the repository named in `init`
pub struct LocalConnector {
    config: Arc<dyn ConfigResolver>,
}

impl LocalConnector {
    pub fn new(config: Arc<dyn ConfigResolver>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, init: &InitRequest) -> Result<Box<dyn Transport>> {
        let transport = LocalTransport::open(self.config.as_ref(), &init.remote)?;
        Ok(Box::new(transport))
    }
}

/// Moves objects between the working copy and a store reachable by path
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: ObjectStore,
    download_dir: PathBuf,
}

impl LocalTransport {
    pub fn new(store: ObjectStore, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            download_dir: download_dir.into(),
        }
    }

    /// Open the store of the repository `remote` refers to
    pub fn open(config: &dyn ConfigResolver, remote: &str) -> Result<Self> {
        let url = resolve_remote(config, remote)?;
        let repo = local_path(&url)?;
        let scope = Scope::At(repo.clone());

        let root = config.repo_path(RepoPathKind::ObjectStore, &scope)?;
        // the repository must exist before its config can be asked anything
        let store = ObjectStore::open(root)?;
        let shared = config
            .get(keys::SHARED_REPOSITORY, &scope)?
            .is_some_and(|v| is_shared_value(&v));
        let store = store.with_shared(shared);
        let download_dir = config.repo_path(RepoPathKind::Temp, &Scope::Current)?;

        info!(
            "local store {} (shared: {})",
            store.root().display(),
            store.is_shared()
        );
        Ok(Self::new(store, download_dir))
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn upload(&self, oid: &Oid, size: u64, path: &Path) -> Result<()> {
        if self.store.contains(oid) {
            debug!("{} already in store", oid);
            return Ok(());
        }
        let (store, oid, src) = (self.store.clone(), *oid, path.to_path_buf());
        let placement = run_blocking(path, move || {
            check_source_size(&src, size)?;
            store.commit_file(&oid, &src)
        })
        .await?;
        debug!("upload {} done ({:?})", oid, placement);
        Ok(())
    }

    async fn download(&self, oid: &Oid, _size: u64) -> Result<PathBuf> {
        let (store, oid, dir) = (self.store.clone(), *oid, self.download_dir.clone());
        run_blocking(&self.download_dir, move || store.export(&oid, &dir)).await
    }
}

/// Absolute filesystem path named by a local remote
fn local_path(url: &str) -> Result<PathBuf> {
    let raw = url.strip_prefix("file://").unwrap_or(url);
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(AgentError::path(path, "local remote must be an absolute path"));
    }
    Ok(path)
}
