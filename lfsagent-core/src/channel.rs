//! Remote execution and bulk copy channel
//!
//! The ssh transport never talks to the network itself. It runs commands on
//! the remote host and copies files through a [`RemoteChannel`]; the default
//! implementation shells out to `ssh` and `scp`.

use crate::bandwidth::BandwidthLimit;
use crate::error::RemoteError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Channel to a remote host
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run `args` on `host`, feeding `stdin`; returns captured stdout
    async fn exec(&self, host: &str, args: &[String], stdin: &str) -> Result<String, RemoteError>;

    /// Copy a local file to `remote_path` on `host`
    async fn send(
        &self,
        local: &Path,
        host: &str,
        remote_path: &str,
        limit: BandwidthLimit,
    ) -> Result<(), RemoteError>;

    /// Copy `remote_path` on `host` to a local file
    async fn receive(
        &self,
        host: &str,
        remote_path: &str,
        local: &Path,
        limit: BandwidthLimit,
    ) -> Result<(), RemoteError>;
}

/// Channel backed by the OpenSSH command-line tools
#[derive(Debug, Clone)]
pub struct SshChannel {
    ssh: String,
    scp: String,
}

impl SshChannel {
    pub fn new(ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        Self {
            ssh: ssh.into(),
            scp: scp.into(),
        }
    }

    async fn run(&self, host: &str, program: &str, args: &[String], stdin: &str) -> Result<String, RemoteError> {
        tracing::debug!("{} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Spawn {
                host: host.to_string(),
                program: program.to_string(),
                source: e,
            })?;

        if let Some(mut pipe) = child.stdin.take() {
            // the remote side may exit without reading everything
            let _ = pipe.write_all(stdin.as_bytes()).await;
        }

        let output = child.wait_with_output().await.map_err(|e| RemoteError::Spawn {
            host: host.to_string(),
            program: program.to_string(),
            source: e,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let captured = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else {
            stdout.trim().to_string()
        };
        Err(RemoteError::Failed {
            host: host.to_string(),
            command: program.to_string(),
            status: output.status.to_string(),
            output: captured,
        })
    }
}

impl Default for SshChannel {
    fn default() -> Self {
        Self::new("ssh", "scp")
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, host: &str, args: &[String], stdin: &str) -> Result<String, RemoteError> {
        self.run(host, &self.ssh, &remote_shell_args(host, args), stdin).await
    }

    async fn send(
        &self,
        local: &Path,
        host: &str,
        remote_path: &str,
        limit: BandwidthLimit,
    ) -> Result<(), RemoteError> {
        let src = local.display().to_string();
        let dst = remote_operand(host, remote_path);
        self.run(host, &self.scp, &bulk_copy_args(limit, &src, &dst), "")
            .await
            .map(|_| ())
    }

    async fn receive(
        &self,
        host: &str,
        remote_path: &str,
        local: &Path,
        limit: BandwidthLimit,
    ) -> Result<(), RemoteError> {
        let src = remote_operand(host, remote_path);
        let dst = local.display().to_string();
        self.run(host, &self.scp, &bulk_copy_args(limit, &src, &dst), "")
            .await
            .map(|_| ())
    }
}

/// Arguments for the remote shell; the remote command line is re-parsed by
/// the remote user's shell, so every word is quoted.
pub fn remote_shell_args(host: &str, args: &[String]) -> Vec<String> {
    let command = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
    vec!["-o".to_string(), "BatchMode=yes".to_string(), "--".to_string(), host.to_string(), command]
}

/// `host:path` operand for the bulk copy program.
///
/// The legacy scp protocol hands the path to the remote shell, so it is
/// quoted like the helper arguments.
pub fn remote_operand(host: &str, remote_path: &str) -> String {
    format!("{}:{}", host, shell_quote(remote_path))
}

/// Arguments for the bulk copy program; `-O` pins the legacy protocol that
/// `remote_operand` quotes for.
pub fn bulk_copy_args(limit: BandwidthLimit, src: &str, dst: &str) -> Vec<String> {
    let mut args = vec!["-O".to_string(), "-q".to_string(), "-B".to_string()];
    if let Some(kbits) = limit.kbits() {
        args.push("-l".to_string());
        args.push(kbits.to_string());
    }
    args.push("--".to_string());
    args.push(src.to_string());
    args.push(dst.to_string());
    args
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@,+".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
