//! lfsagent Core Library
//!
//! Custom transfer agents for large-file storage:
//! - Line-delimited JSON control protocol and its session loop
//! - Content-addressed object store with sharded paths
//! - Local transport (link or copy into a store on a mounted filesystem)
//! - Ssh transport (pre-upload / bulk copy / post-upload transactions)
//! - Remote helper serving those transactions on the store's host
//! - Bandwidth limiting and configuration lookup

pub mod bandwidth;
pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod helper;
pub mod link;
pub mod object;
pub mod protocol;
pub mod store;
pub mod transport;

pub use bandwidth::BandwidthLimit;
pub use channel::{RemoteChannel, SshChannel};
pub use config::{ConfigResolver, GitConfig, RepoPathKind, Scope, StaticConfig};
pub use error::{AgentError, ConfigError, ErrorCode, RemoteError, Result};
pub use handler::{Agent, Exit};
pub use helper::{HELPER_PROTOCOL_VERSION, HelperRequest, Phase, PostUploadReply, PreUploadReply, RemoteRepo};
pub use object::{Oid, storage_path};
pub use protocol::{Event, InitRequest, Request};
pub use store::{ObjectStore, Placement};
pub use transport::{Connector, LocalConnector, LocalTransport, SshConnector, SshTransport, Transport};
