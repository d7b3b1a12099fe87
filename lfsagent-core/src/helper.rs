//! Remote side of the ssh transaction protocol
//!
//! These phases run on the host that owns the object store, invoked through
//! the remote shell as
//!
//! ```text
//! lfs-agent helper --protocol 1 pre-upload   <repo> <oid>
//! lfs-agent helper --protocol 1 post-upload  <repo> <oid> <tmp>
//! lfs-agent helper --protocol 1 pre-download <repo> <oid>
//! ```
//!
//! Alternate repositories arrive on stdin, one path per line, and stdin is
//! always read to the end before any phase runs. Each phase prints a single
//! reply line; failures exit nonzero with the diagnostic on stderr.

use crate::config::{ConfigResolver, RepoPathKind, Scope, is_shared_value, keys};
use crate::error::{AgentError, Result};
use crate::link::can_link;
use crate::object::{Oid, storage_path};
use crate::store::{ObjectStore, Placement, temp_name};
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version of the helper command-line contract
pub const HELPER_PROTOCOL_VERSION: u32 = 1;

/// Remote transaction phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreUpload,
    PostUpload,
    PreDownload,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreUpload => "pre-upload",
            Phase::PostUpload => "post-upload",
            Phase::PreDownload => "pre-download",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre-upload" => Ok(Phase::PreUpload),
            "post-upload" => Ok(Phase::PostUpload),
            "pre-download" => Ok(Phase::PreDownload),
            other => Err(AgentError::Protocol(format!("unknown helper phase {:?}", other))),
        }
    }
}

/// One helper invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperRequest {
    pub version: u32,
    pub phase: Phase,
    pub repo: PathBuf,
    pub oid: String,
    /// Temp path returned by pre-upload (post-upload only)
    pub tmp: Option<PathBuf>,
}

impl HelperRequest {
    pub fn new(phase: Phase, repo: &Path, oid: &Oid) -> Self {
        Self {
            version: HELPER_PROTOCOL_VERSION,
            phase,
            repo: repo.to_path_buf(),
            oid: oid.to_hex(),
            tmp: None,
        }
    }

    pub fn with_tmp(mut self, tmp: impl Into<PathBuf>) -> Self {
        self.tmp = Some(tmp.into());
        self
    }

    /// Arguments following the helper command on the remote command line
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "helper".to_string(),
            "--protocol".to_string(),
            self.version.to_string(),
            self.phase.as_str().to_string(),
            self.repo.display().to_string(),
            self.oid.clone(),
        ];
        if let Some(tmp) = &self.tmp {
            args.push(tmp.display().to_string());
        }
        args
    }
}

/// Reply to pre-upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreUploadReply {
    /// Object already committed
    Available,
    /// Object hard-linked from the given alternate repository
    Linked(PathBuf),
    /// Client must send the content to this temp path
    Send(PathBuf),
}

impl PreUploadReply {
    /// Parse the first line of helper output
    pub fn parse(output: &str) -> Option<Self> {
        let line = output.lines().next()?.trim_end();
        let (word, arg) = line.split_once(' ')?;
        match (word, arg) {
            ("AVAILABLE", "-") => Some(PreUploadReply::Available),
            ("LINKED", alt) if !alt.is_empty() => Some(PreUploadReply::Linked(PathBuf::from(alt))),
            ("SEND", tmp) if tmp.starts_with('/') => Some(PreUploadReply::Send(PathBuf::from(tmp))),
            _ => None,
        }
    }
}

impl std::fmt::Display for PreUploadReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreUploadReply::Available => write!(f, "AVAILABLE -"),
            PreUploadReply::Linked(alt) => write!(f, "LINKED {}", alt.display()),
            PreUploadReply::Send(tmp) => write!(f, "SEND {}", tmp.display()),
        }
    }
}

/// Reply to post-upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostUploadReply {
    Committed,
    /// Another writer committed the object first; the temp file was dropped
    Exists,
}

impl std::fmt::Display for PostUploadReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostUploadReply::Committed => write!(f, "COMMITTED"),
            PostUploadReply::Exists => write!(f, "EXISTS"),
        }
    }
}

/// Object store and temp area of a repository on this host
#[derive(Debug, Clone)]
pub struct RemoteRepo {
    store: ObjectStore,
    tmp_dir: PathBuf,
}

impl RemoteRepo {
    /// Open the repository at the absolute path `repo`
    pub fn open(config: &dyn ConfigResolver, repo: &Path) -> Result<Self> {
        if !repo.is_absolute() {
            return Err(AgentError::path(repo, "repository path must be absolute"));
        }
        let scope = Scope::At(repo.to_path_buf());
        let root = config.repo_path(RepoPathKind::ObjectStore, &scope)?;
        let tmp_dir = config.repo_path(RepoPathKind::Temp, &scope)?;
        let store = ObjectStore::open(root)?;
        let shared = config
            .get(keys::SHARED_REPOSITORY, &scope)?
            .is_some_and(|v| is_shared_value(&v));
        Ok(Self {
            store: store.with_shared(shared),
            tmp_dir,
        })
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Decide whether the client has to send `oid`.
    ///
    /// Alternates are checked in the order given; the first one holding a
    /// linkable copy wins.
    pub fn pre_upload(
        &self,
        config: &dyn ConfigResolver,
        oid: &Oid,
        alternates: &[PathBuf],
    ) -> Result<PreUploadReply> {
        if self.store.contains(oid) {
            return Ok(PreUploadReply::Available);
        }

        for alt in alternates {
            if self.try_alternate(config, oid, alt) {
                return Ok(PreUploadReply::Linked(alt.clone()));
            }
        }

        let tmp = self.allocate_temp(oid)?;
        debug!("{} needs transfer into {}", oid, tmp.display());
        Ok(PreUploadReply::Send(tmp))
    }

    /// Verify and commit a temp file filled by the client
    pub fn post_upload(&self, oid: &Oid, tmp: &Path) -> Result<PostUploadReply> {
        if tmp.parent() != Some(self.tmp_dir.as_path()) {
            return Err(AgentError::path(tmp, "not a temp file of this repository"));
        }
        if !tmp.is_file() {
            return Err(AgentError::path(tmp, "temp file does not exist"));
        }

        let actual = Oid::from_file(tmp).map_err(|e| AgentError::path(tmp, format!("cannot hash: {}", e)))?;
        if actual != *oid {
            if let Err(e) = fs::remove_file(tmp) {
                warn!("failed to remove rejected upload {}: {}", tmp.display(), e);
            }
            return Err(AgentError::ChecksumMismatch {
                oid: oid.to_hex(),
                actual: actual.to_hex(),
            });
        }

        match self.store.commit_temp(oid, tmp)? {
            Placement::AlreadyPresent => Ok(PostUploadReply::Exists),
            _ => Ok(PostUploadReply::Committed),
        }
    }

    /// Absolute path of a committed object
    pub fn pre_download(&self, oid: &Oid) -> Result<PathBuf> {
        let path = self.store.object_path(oid);
        if !path.is_file() {
            return Err(AgentError::MissingObject {
                oid: oid.to_hex(),
                store: self.store.root().to_path_buf(),
            });
        }
        Ok(path)
    }

    fn try_alternate(&self, config: &dyn ConfigResolver, oid: &Oid, alt: &Path) -> bool {
        if !alt.is_absolute() {
            warn!("ignoring relative alternate {}", alt.display());
            return false;
        }
        let root = match config.repo_path(RepoPathKind::ObjectStore, &Scope::At(alt.to_path_buf())) {
            Ok(root) => root,
            Err(e) => {
                warn!("ignoring alternate {}: {}", alt.display(), e);
                return false;
            }
        };
        let candidate = storage_path(&root, oid);
        if !candidate.is_file() {
            return false;
        }
        let shard_dir = match self.store.ensure_shard_dirs(oid) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        if !can_link(&candidate, &shard_dir).unwrap_or(false) {
            debug!("alternate {} holds {} but cannot be linked", alt.display(), oid);
            return false;
        }

        match self.store.commit_link(oid, &candidate) {
            Ok(_) => {
                info!("linked {} from alternate {}", oid, alt.display());
                true
            }
            // a concurrent writer got there first
            Err(_) if self.store.contains(oid) => true,
            Err(e) => {
                warn!("linking from alternate {} failed: {}", alt.display(), e);
                false
            }
        }
    }

    fn allocate_temp(&self, oid: &Oid) -> Result<PathBuf> {
        self.store.ensure_dir(&self.tmp_dir)?;
        let tmp = self.tmp_dir.join(temp_name(oid));
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(|e| AgentError::directory(&tmp, e))?;
        Ok(tmp)
    }
}

/// Serve one helper invocation and return its reply line.
///
/// `input` is the complete stdin of the invocation.
pub fn serve(config: &dyn ConfigResolver, request: &HelperRequest, input: &str) -> Result<String> {
    if request.version != HELPER_PROTOCOL_VERSION {
        return Err(AgentError::Protocol(format!(
            "helper speaks protocol {}, client sent {}",
            HELPER_PROTOCOL_VERSION, request.version
        )));
    }
    let oid = Oid::parse(&request.oid)?;
    let repo = RemoteRepo::open(config, &request.repo)?;

    match request.phase {
        Phase::PreUpload => {
            let alternates: Vec<PathBuf> = input
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect();
            Ok(repo.pre_upload(config, &oid, &alternates)?.to_string())
        }
        Phase::PostUpload => {
            let tmp = request
                .tmp
                .as_deref()
                .ok_or_else(|| AgentError::Protocol("post-upload needs a temp path".to_string()))?;
            Ok(repo.post_upload(&oid, tmp)?.to_string())
        }
        Phase::PreDownload => Ok(repo.pre_download(&oid)?.display().to_string()),
    }
}
