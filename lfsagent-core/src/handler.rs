//! Control loop serving the host's transfer requests
//!
//! Requests are handled strictly one at a time: the response to a line is
//! written and flushed before the next line is read.

use crate::error::{AgentError, Result};
use crate::object::Oid;
use crate::protocol::{DownloadRequest, Event, InitResponse, Request, UploadRequest, encode, parse_request};
use crate::transport::{Connector, Transport};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// How a session ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The host sent `terminate`
    Terminated,
    /// The host closed the stream
    EndOfInput,
}

/// One agent session
pub struct Agent<C> {
    connector: C,
    transport: Option<Box<dyn Transport>>,
}

impl<C: Connector> Agent<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            transport: None,
        }
    }

    /// Whether `init` has succeeded
    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    /// Serve requests from `input` until `terminate`, end of input or a
    /// fatal error.
    pub async fn run<R, W>(&mut self, input: R, output: &mut W) -> Result<Exit>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| AgentError::Protocol(format!("cannot read request: {}", e)))?;
            let Some(line) = line else {
                info!("input closed, shutting down");
                return Ok(Exit::EndOfInput);
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_request(&line)? {
                Request::Init(init) => {
                    if self.is_configured() {
                        return Err(AgentError::Protocol("agent is already initialized".to_string()));
                    }
                    match self.connector.connect(&init).await {
                        Ok(transport) => {
                            self.transport = Some(transport);
                            write_line(output, &InitResponse::ok()).await?;
                        }
                        Err(e) => {
                            write_line(output, &InitResponse::failed(&e)).await?;
                            return Err(e);
                        }
                    }
                }
                Request::Upload(req) => {
                    let transport = self.configured("upload")?;
                    let events = upload(transport, &req).await;
                    for event in &events {
                        write_line(output, event).await?;
                    }
                }
                Request::Download(req) => {
                    let transport = self.configured("download")?;
                    let events = download(transport, &req).await;
                    for event in &events {
                        write_line(output, event).await?;
                    }
                }
                Request::Terminate => {
                    info!("terminate received");
                    return Ok(Exit::Terminated);
                }
            }
        }
    }

    fn configured(&self, event: &str) -> Result<&dyn Transport> {
        self.transport
            .as_deref()
            .ok_or_else(|| AgentError::Protocol(format!("{} request before init", event)))
    }
}

async fn upload(transport: &dyn Transport, req: &UploadRequest) -> Vec<Event> {
    debug!("upload {} ({} bytes) from {}", req.oid, req.size, req.path.display());
    let result = match Oid::parse(&req.oid) {
        Ok(oid) => transport.upload(&oid, req.size, &req.path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => vec![Event::progress_done(&req.oid, req.size), Event::complete(&req.oid, None)],
        Err(e) => {
            warn!("upload of {} failed: {}", req.oid, e);
            vec![Event::failed(&req.oid, &e)]
        }
    }
}

async fn download(transport: &dyn Transport, req: &DownloadRequest) -> Vec<Event> {
    debug!("download {} ({} bytes)", req.oid, req.size);
    let result = match Oid::parse(&req.oid) {
        Ok(oid) => transport.download(&oid, req.size).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(path) => vec![
            Event::progress_done(&req.oid, req.size),
            Event::complete(&req.oid, Some(path)),
        ],
        Err(e) => {
            warn!("download of {} failed: {}", req.oid, e);
            vec![Event::failed(&req.oid, &e)]
        }
    }
}

async fn write_line<W, T>(output: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let line = encode(message)?;
    let broken = |e: std::io::Error| AgentError::Protocol(format!("cannot write response: {}", e));
    output.write_all(line.as_bytes()).await.map_err(broken)?;
    output.flush().await.map_err(broken)
}
