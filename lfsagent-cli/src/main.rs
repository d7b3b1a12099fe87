//! lfs-agent: custom transfer agents for large-file storage.
//!
//! Supports:
//! - Local transfers into an object store on a mounted filesystem
//! - Ssh transfers into a store on another host
//! - The remote helper the ssh agent runs on that host
//!
//! # Usage
//!
//! ```bash
//! # Register the agents with the host tool
//! git config lfs.customtransfer.local.path "lfs-agent local"
//! git config lfs.customtransfer.ssh.path "lfs-agent ssh"
//!
//! # Remote helper, invoked over ssh by the ssh agent
//! lfs-agent helper --protocol 1 pre-upload /data/repo.git <oid>
//! ```
//!
//! Logs go to stderr; stdout carries the control protocol. Set
//! `LFS_AGENT_LOG` to adjust the filter.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use lfsagent_core::helper::{self, HELPER_PROTOCOL_VERSION, HelperRequest, Phase};
use lfsagent_core::{Agent, ConfigResolver, Connector, Exit, GitConfig, LocalConnector, SshConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "LFS_AGENT_LOG";
const DEFAULT_LOG_FILTER: &str = "lfs_agent=info,lfsagent_core=info";

#[derive(Parser, Debug)]
#[command(name = "lfs-agent")]
#[command(author = "lfsagent Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Custom transfer agents for large-file storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the control protocol with the local-filesystem transport
    Local,

    /// Serve the control protocol with the ssh transport
    Ssh,

    /// Run one remote transaction phase against a repository on this host
    Helper {
        /// Helper protocol version spoken by the client
        #[arg(long, default_value_t = HELPER_PROTOCOL_VERSION)]
        protocol: u32,
        /// pre-upload, post-upload or pre-download
        phase: String,
        /// Absolute path of the repository
        repo: PathBuf,
        /// Object id
        oid: String,
        /// Temp file returned by pre-upload (post-upload only)
        tmp: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .init();

    let cli = Cli::parse();
    let config: Arc<dyn ConfigResolver> = Arc::new(GitConfig::new());

    match cli.command {
        Commands::Local => serve(LocalConnector::new(config)).await,
        Commands::Ssh => serve(SshConnector::new(config)).await,
        Commands::Helper {
            protocol,
            phase,
            repo,
            oid,
            tmp,
        } => {
            let request = HelperRequest {
                version: protocol,
                phase: phase.parse::<Phase>()?,
                repo,
                oid,
                tmp,
            };
            cmd_helper(config.as_ref(), &request).await
        }
    }
}

async fn serve<C: Connector>(connector: C) -> Result<()> {
    let mut agent = Agent::new(connector);
    let input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    match agent.run(input, &mut output).await {
        Ok(Exit::Terminated) | Ok(Exit::EndOfInput) => Ok(()),
        Err(e) => {
            tracing::error!("fatal: {} (code {})", e, e.code().as_i32());
            Err(anyhow!(e))
        }
    }
}

async fn cmd_helper(config: &dyn ConfigResolver, request: &HelperRequest) -> Result<()> {
    // the client may still be writing alternates; take all of stdin first
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read helper input")?;

    let reply = helper::serve(config, request, &input)
        .with_context(|| format!("{} {} failed", request.phase.as_str(), request.oid))?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_args_round_trip() {
        let oid = lfsagent_core::Oid::from_data(b"x");
        let request = HelperRequest::new(Phase::PostUpload, std::path::Path::new("/data/repo"), &oid)
            .with_tmp("/data/repo/lfs/tmp/t");
        let argv = std::iter::once("lfs-agent".to_string()).chain(request.to_args());
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Helper {
                protocol,
                phase,
                repo,
                oid: parsed,
                tmp,
            } => {
                assert_eq!(protocol, HELPER_PROTOCOL_VERSION);
                assert_eq!(phase.parse::<Phase>().unwrap(), Phase::PostUpload);
                assert_eq!(repo, PathBuf::from("/data/repo"));
                assert_eq!(parsed, oid.to_hex());
                assert_eq!(tmp, Some(PathBuf::from("/data/repo/lfs/tmp/t")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_agent_subcommands() {
        assert!(matches!(Cli::try_parse_from(["lfs-agent", "local"]).unwrap().command, Commands::Local));
        assert!(matches!(Cli::try_parse_from(["lfs-agent", "ssh"]).unwrap().command, Commands::Ssh));
        assert!(Cli::try_parse_from(["lfs-agent", "rsync"]).is_err());
    }
}
