//! Configuration lookup for the transfer agents
//!
//! The agents never read configuration files themselves. Everything goes
//! through a [`ConfigResolver`], which answers two kinds of question: the
//! value of a configuration key, and the location of a repository's object
//! store or temp directory.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Configuration keys consulted by the agents.
pub mod keys {
    /// Total bandwidth cap in kbit/s, `0` meaning unlimited.
    pub const BANDWIDTH: &str = "lfsagent.bandwidth";
    /// Number of transfers the host runs concurrently.
    pub const CONCURRENT_TRANSFERS: &str = "lfs.concurrenttransfers";
    /// Alternate repositories on the remote host (multi-valued).
    pub const ALTERNATES: &str = "lfsagent.alternates";
    /// Command that runs the remote helper on the remote host.
    pub const REMOTE_HELPER: &str = "lfsagent.remotehelper";
    /// Remote shell program.
    pub const SSH_PROGRAM: &str = "lfsagent.ssh";
    /// Bulk copy program.
    pub const SCP_PROGRAM: &str = "lfsagent.scp";
    /// Shared-repository marker of the repository holding the store.
    pub const SHARED_REPOSITORY: &str = "core.sharedrepository";

    /// Key holding the URL of a named remote
    pub fn remote_url(name: &str) -> String {
        format!("remote.{}.url", name)
    }
}

/// Which repository a lookup applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The repository the agent was started in
    Current,
    /// A repository at an explicit path (e.g. the store behind a local remote)
    At(PathBuf),
}

/// Repository-internal directories the agents need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoPathKind {
    /// Root of the committed object tree (`lfs/objects`)
    ObjectStore,
    /// Scratch directory for in-flight transfers (`lfs/tmp`)
    Temp,
}

impl RepoPathKind {
    fn relative(self) -> &'static str {
        match self {
            RepoPathKind::ObjectStore => "lfs/objects",
            RepoPathKind::Temp => "lfs/tmp",
        }
    }
}

/// Query surface for configuration values and repository paths
pub trait ConfigResolver: Send + Sync {
    /// Get a single configuration value, `None` if unset
    fn get(&self, key: &str, scope: &Scope) -> Result<Option<String>, ConfigError>;

    /// Get every value of a multi-valued key
    fn get_all(&self, key: &str, scope: &Scope) -> Result<Vec<String>, ConfigError>;

    /// Absolute path of a repository-internal directory
    fn repo_path(&self, kind: RepoPathKind, scope: &Scope) -> Result<PathBuf, ConfigError>;
}

/// Parse an unsigned integer value, `None` if the key is unset
pub fn get_u64(
    config: &dyn ConfigResolver,
    key: &str,
    scope: &Scope,
) -> Result<Option<u64>, ConfigError> {
    match config.get(key, scope)? {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Whether a `core.sharedRepository` value asks for group-writable storage
pub fn is_shared_value(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    match v.as_str() {
        "true" | "group" | "1" | "all" | "world" | "everybody" | "2" => true,
        _ if v.len() > 1 && v.starts_with('0') => u32::from_str_radix(&v, 8)
            .map(|mode| mode & 0o070 != 0)
            .unwrap_or(false),
        _ => false,
    }
}

/// Git directory of the repository at `path`: `path/.git` for a working
/// tree, `path` itself for a bare repository.
pub fn git_dir_at(path: &Path) -> PathBuf {
    let dotgit = path.join(".git");
    if dotgit.is_dir() {
        dotgit
    } else {
        path.to_path_buf()
    }
}

/// Configuration backed by the `git` executable
pub struct GitConfig {
    git: PathBuf,
}

impl GitConfig {
    pub fn new() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable
    pub fn with_program(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    fn command(&self, scope: &Scope) -> Command {
        let mut cmd = Command::new(&self.git);
        if let Scope::At(path) = scope {
            cmd.arg("-C").arg(path);
        }
        cmd
    }

    fn config_values(&self, key: &str, scope: &Scope, flag: &str) -> Result<Vec<String>, ConfigError> {
        let output = self
            .command(scope)
            .args(["config", flag, key])
            .output()
            .map_err(|e| ConfigError::Lookup {
                key: key.to_string(),
                message: format!("failed to run {}: {}", self.git.display(), e),
            })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(stdout.lines().map(str::to_string).collect());
        }
        // git config exits 1 when the key is not set
        if output.status.code() == Some(1) {
            return Ok(Vec::new());
        }
        Err(ConfigError::Lookup {
            key: key.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn current_git_dir(&self) -> Result<PathBuf, ConfigError> {
        let output = self
            .command(&Scope::Current)
            .args(["rev-parse", "--absolute-git-dir"])
            .output()
            .map_err(|e| ConfigError::RepoPath(format!("failed to run {}: {}", self.git.display(), e)))?;
        if !output.status.success() {
            return Err(ConfigError::RepoPath(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if dir.is_empty() {
            return Err(ConfigError::RepoPath("git reported an empty git dir".to_string()));
        }
        Ok(PathBuf::from(dir))
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver for GitConfig {
    fn get(&self, key: &str, scope: &Scope) -> Result<Option<String>, ConfigError> {
        Ok(self.config_values(key, scope, "--get")?.into_iter().next())
    }

    fn get_all(&self, key: &str, scope: &Scope) -> Result<Vec<String>, ConfigError> {
        self.config_values(key, scope, "--get-all")
    }

    fn repo_path(&self, kind: RepoPathKind, scope: &Scope) -> Result<PathBuf, ConfigError> {
        let git_dir = match scope {
            Scope::Current => self.current_git_dir()?,
            Scope::At(path) => git_dir_at(path),
        };
        Ok(git_dir.join(kind.relative()))
    }
}

/// In-memory configuration
///
/// Values are keyed by scope; `Scope::At` lookups fall back to nothing, the
/// same as a repository without that key set.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    git_dir: Option<PathBuf>,
    values: HashMap<(Scope, String), Vec<String>>,
}

impl StaticConfig {
    /// Create a config whose current repository lives at `git_dir`
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: Some(git_dir.into()),
            values: HashMap::new(),
        }
    }

    /// Add a value for the current repository
    pub fn with(self, key: &str, value: &str) -> Self {
        self.with_scoped(Scope::Current, key, value)
    }

    /// Add a value for a specific scope
    pub fn with_scoped(mut self, scope: Scope, key: &str, value: &str) -> Self {
        self.values
            .entry((scope, key.to_ascii_lowercase()))
            .or_default()
            .push(value.to_string());
        self
    }
}

impl ConfigResolver for StaticConfig {
    fn get(&self, key: &str, scope: &Scope) -> Result<Option<String>, ConfigError> {
        Ok(self.get_all(key, scope)?.into_iter().last())
    }

    fn get_all(&self, key: &str, scope: &Scope) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .values
            .get(&(scope.clone(), key.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_default())
    }

    fn repo_path(&self, kind: RepoPathKind, scope: &Scope) -> Result<PathBuf, ConfigError> {
        let git_dir = match scope {
            Scope::Current => self
                .git_dir
                .clone()
                .ok_or_else(|| ConfigError::RepoPath("not inside a repository".to_string()))?,
            Scope::At(path) => git_dir_at(path),
        };
        Ok(git_dir.join(kind.relative()))
    }
}
