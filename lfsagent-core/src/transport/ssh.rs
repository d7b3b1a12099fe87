//! Transport to a store on another host, driven over ssh and scp
//!
//! Every object goes through a small transaction with the helper on the
//! remote host. Uploads ask first (pre-upload), copy only when told to, and
//! let the remote side verify and commit (post-upload). Downloads ask for the
//! object's path (pre-download) and copy it into the local temp area.

use super::{Connector, Transport, check_source_size, resolve_remote};
use crate::bandwidth::BandwidthLimit;
use crate::channel::{RemoteChannel, SshChannel};
use crate::config::{ConfigResolver, RepoPathKind, Scope, keys};
use crate::error::{AgentError, RemoteError, Result};
use crate::helper::{HelperRequest, Phase, PreUploadReply};
use crate::object::Oid;
use crate::protocol::InitRequest;
use crate::store::temp_name;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Command that runs the helper when `lfsagent.remotehelper` is unset
pub const DEFAULT_REMOTE_HELPER: &str = "lfs-agent";

/// Host and repository of an ssh remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub repo: PathBuf,
}

/// Parse `ssh://<host>//<absolute-path>`.
///
/// The path component must itself be absolute, so the URL carries a double
/// slash after the host. Trailing slashes are dropped.
pub fn parse_ssh_url(url: &str) -> Result<SshEndpoint> {
    let bad = || AgentError::UrlFormat { url: url.to_string() };

    let rest = url.strip_prefix("ssh://").ok_or_else(bad)?;
    let (host, path) = rest.split_once('/').ok_or_else(bad)?;
    if host.is_empty() || !path.starts_with('/') {
        return Err(bad());
    }
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return Err(bad());
    }
    Ok(SshEndpoint {
        host: host.to_string(),
        repo: PathBuf::from(path),
    })
}

/// Builds an [`SshTransport`] from configuration
pub struct SshConnector {
    config: Arc<dyn ConfigResolver>,
    channel: Option<Arc<dyn RemoteChannel>>,
}

impl SshConnector {
    pub fn new(config: Arc<dyn ConfigResolver>) -> Self {
        Self { config, channel: None }
    }

    /// Use `channel` instead of the configured ssh and scp programs
    pub fn with_channel(mut self, channel: Arc<dyn RemoteChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    fn configured_channel(&self) -> Result<Arc<dyn RemoteChannel>> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }
        let ssh = self.config.get(keys::SSH_PROGRAM, &Scope::Current)?;
        let scp = self.config.get(keys::SCP_PROGRAM, &Scope::Current)?;
        Ok(Arc::new(SshChannel::new(
            ssh.unwrap_or_else(|| "ssh".to_string()),
            scp.unwrap_or_else(|| "scp".to_string()),
        )))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, init: &InitRequest) -> Result<Box<dyn Transport>> {
        let config = self.config.as_ref();
        let url = resolve_remote(config, &init.remote)?;
        let endpoint = parse_ssh_url(&url)?;
        let limit = BandwidthLimit::from_config(config, init.concurrenttransfers)?;
        let alternates = config.get_all(keys::ALTERNATES, &Scope::Current)?;
        let helper = config
            .get(keys::REMOTE_HELPER, &Scope::Current)?
            .unwrap_or_else(|| DEFAULT_REMOTE_HELPER.to_string());
        let local_tmp = config.repo_path(RepoPathKind::Temp, &Scope::Current)?;

        info!(
            "ssh remote {}:{} (limit {:?}, {} alternates)",
            endpoint.host,
            endpoint.repo.display(),
            limit,
            alternates.len()
        );
        Ok(Box::new(SshTransport {
            endpoint,
            limit,
            alternates,
            helper,
            channel: self.configured_channel()?,
            local_tmp,
        }))
    }
}

/// Transport speaking the helper protocol to one remote repository
pub struct SshTransport {
    endpoint: SshEndpoint,
    limit: BandwidthLimit,
    alternates: Vec<String>,
    helper: String,
    channel: Arc<dyn RemoteChannel>,
    local_tmp: PathBuf,
}

impl SshTransport {
    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    pub fn limit(&self) -> BandwidthLimit {
        self.limit
    }

    async fn run_helper(&self, request: &HelperRequest, stdin: &str) -> std::result::Result<String, RemoteError> {
        let mut args: Vec<String> = self.helper.split_whitespace().map(str::to_string).collect();
        args.extend(request.to_args());
        debug!("{} on {}", request.phase.as_str(), self.endpoint.host);
        self.channel.exec(&self.endpoint.host, &args, stdin).await
    }

    fn unexpected(&self, output: &str) -> RemoteError {
        RemoteError::Failed {
            host: self.endpoint.host.clone(),
            command: self.helper.clone(),
            status: "unexpected reply".to_string(),
            output: output.trim().to_string(),
        }
    }

    async fn post_upload(&self, oid: &Oid, tmp: &Path) -> Result<()> {
        let request = HelperRequest::new(Phase::PostUpload, &self.endpoint.repo, oid).with_tmp(tmp);
        let output = self.run_helper(&request, "").await.map_err(AgentError::Upload)?;
        match output.lines().next().map(str::trim) {
            Some("COMMITTED") => info!("{} committed on {}", oid, self.endpoint.host),
            Some("EXISTS") => info!("{} was committed concurrently on {}", oid, self.endpoint.host),
            _ => return Err(AgentError::Upload(self.unexpected(&output))),
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn upload(&self, oid: &Oid, size: u64, path: &Path) -> Result<()> {
        check_source_size(path, size)?;

        let mut alternates = self.alternates.join("\n");
        alternates.push('\n');
        let request = HelperRequest::new(Phase::PreUpload, &self.endpoint.repo, oid);
        let output = self
            .run_helper(&request, &alternates)
            .await
            .map_err(|e| AgentError::PreUpload {
                host: self.endpoint.host.clone(),
                output: e.to_string(),
            })?;

        match PreUploadReply::parse(&output) {
            Some(PreUploadReply::Available) => {
                debug!("{} already on {}", oid, self.endpoint.host);
                Ok(())
            }
            Some(PreUploadReply::Linked(alt)) => {
                info!("{} linked from {} on {}", oid, alt.display(), self.endpoint.host);
                Ok(())
            }
            Some(PreUploadReply::Send(tmp)) => {
                let remote_tmp = tmp.display().to_string();
                self.channel
                    .send(path, &self.endpoint.host, &remote_tmp, self.limit)
                    .await
                    .map_err(AgentError::Upload)?;
                self.post_upload(oid, &tmp).await
            }
            None => Err(AgentError::PreUpload {
                host: self.endpoint.host.clone(),
                output: output.trim().to_string(),
            }),
        }
    }

    async fn download(&self, oid: &Oid, _size: u64) -> Result<PathBuf> {
        let request = HelperRequest::new(Phase::PreDownload, &self.endpoint.repo, oid);
        let output = self
            .run_helper(&request, "")
            .await
            .map_err(|e| AgentError::PreDownload {
                host: self.endpoint.host.clone(),
                output: e.to_string(),
            })?;
        let remote_path = output.lines().next().map(str::trim).unwrap_or_default();
        if !remote_path.starts_with('/') {
            return Err(AgentError::PreDownload {
                host: self.endpoint.host.clone(),
                output: output.trim().to_string(),
            });
        }

        std::fs::create_dir_all(&self.local_tmp).map_err(|e| AgentError::directory(&self.local_tmp, e))?;
        let dst = self.local_tmp.join(temp_name(oid));
        if let Err(e) = self
            .channel
            .receive(&self.endpoint.host, remote_path, &dst, self.limit)
            .await
        {
            if dst.exists() {
                if let Err(rm) = std::fs::remove_file(&dst) {
                    warn!("failed to remove partial download {}: {}", dst.display(), rm);
                }
            }
            return Err(AgentError::Download(e));
        }
        Ok(dst)
    }
}
