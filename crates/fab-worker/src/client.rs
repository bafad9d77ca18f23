//! Client for the worker agent.
//!
//! Every operation opens one framed connection, sends a signed request,
//! and follows the per-endpoint frame discipline.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rsa::RsaPrivateKey;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

use fab_buildlog::{Line, Stream};
use fab_proto::{
    framed, AgentRequest, AgentResponse, CommandRequest, Frame, FrameCodec, FramedChannel,
    MkdirRequest, ReadFileRequest, SignedEnvelope, WriteFileRequest,
};

use crate::error::WorkerError;

/// File content chunk size on the wire.
const CHUNK_SIZE: usize = 1 << 20;

/// Opens connections to one worker agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn connect(&self) -> Result<FramedChannel, WorkerError>;
}

/// TCP + pinned TLS transport.
pub struct TlsAgentTransport {
    addr: String,
    connector: TlsConnector,
}

impl TlsAgentTransport {
    /// `cert_der` is the identity certificate the worker must present.
    pub fn new(addr: String, cert_der: Vec<u8>) -> Self {
        let config = crate::tls::pinned_client_config(cert_der);
        TlsAgentTransport {
            addr,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl AgentTransport for TlsAgentTransport {
    async fn connect(&self) -> Result<FramedChannel, WorkerError> {
        let tcp = tokio::net::TcpStream::connect(&self.addr)
            .await
            .map_err(|e| WorkerError::Unreachable(format!("{}: {e}", self.addr)))?;
        // The name is immaterial; the verifier pins the exact certificate.
        let name = ServerName::try_from("worker").expect("static server name");
        let stream = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(|e| WorkerError::Unreachable(format!("tls handshake: {e}")))?;
        Ok(framed(stream, FrameCodec::new()))
    }
}

/// Authenticated client for one worker.
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    auth_key: Arc<RsaPrivateKey>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient").finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, auth_key: Arc<RsaPrivateKey>) -> Self {
        AgentClient {
            transport,
            auth_key,
        }
    }

    async fn open(&self, request: &AgentRequest) -> Result<FramedChannel, WorkerError> {
        let mut channel = self.transport.connect().await?;
        let signed = SignedEnvelope::sign(request, &self.auth_key)?;
        channel.send(Frame::Text(signed)).await?;
        Ok(channel)
    }

    async fn read_response(channel: &mut FramedChannel) -> Result<AgentResponse, WorkerError> {
        match channel.next().await {
            Some(Ok(Frame::Text(text))) => {
                let response: AgentResponse = serde_json::from_str(&text)
                    .map_err(|e| WorkerError::Protocol(format!("bad response: {e}")))?;
                Ok(response)
            }
            Some(Ok(_)) => Err(WorkerError::Protocol("expected text response".to_string())),
            Some(Err(e)) => Err(e.into()),
            None => Err(WorkerError::Protocol(
                "connection closed before response".to_string(),
            )),
        }
    }

    /// Make a directory on the worker.
    pub async fn mkdir(&self, dir: &str, parent: bool) -> Result<(), WorkerError> {
        let mut channel = self
            .open(&AgentRequest::Mkdir(MkdirRequest {
                dir: dir.to_string(),
                parent,
            }))
            .await?;
        Self::read_response(&mut channel)
            .await?
            .into_result()
            .map_err(WorkerError::Rejected)
    }

    /// Write a file on the worker.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), WorkerError> {
        let mut channel = self
            .open(&AgentRequest::Write(WriteFileRequest {
                path: path.to_string(),
            }))
            .await?;

        for chunk in data.chunks(CHUNK_SIZE) {
            channel.send(Frame::binary(chunk.to_vec())).await?;
        }
        channel.send(Frame::end_of_stream()).await?;
        channel.flush().await?;

        Self::read_response(&mut channel)
            .await?
            .into_result()
            .map_err(WorkerError::Rejected)
    }

    /// Read a file from the worker.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, WorkerError> {
        let mut channel = self
            .open(&AgentRequest::Read(ReadFileRequest {
                path: path.to_string(),
            }))
            .await?;

        Self::read_response(&mut channel)
            .await?
            .into_result()
            .map_err(WorkerError::Rejected)?;

        let mut data = Vec::new();
        loop {
            match channel.next().await {
                Some(Ok(frame)) if frame.is_end_of_stream() => break,
                Some(Ok(Frame::Binary(chunk))) => data.extend_from_slice(&chunk),
                Some(Ok(Frame::Text(_))) => {
                    return Err(WorkerError::Protocol(
                        "unexpected text frame in file body".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(WorkerError::Protocol(
                        "connection closed mid-file".to_string(),
                    ))
                }
            }
        }
        Ok(data)
    }

    /// Run a command on the worker, forwarding its log lines.
    ///
    /// Returns once the agent's terminating meta line arrives: `Ok` for
    /// `"success"`, [`WorkerError::CommandFailed`] otherwise; the failure
    /// text is also forwarded to `on_line` on the stderr stream.
    pub async fn run(
        &self,
        request: CommandRequest,
        stdin: Option<Vec<u8>>,
        on_line: &(dyn Fn(Line) + Send + Sync),
    ) -> Result<(), WorkerError> {
        let wants_stdin = request.stdin;
        let mut channel = self.open(&AgentRequest::Run(request)).await?;

        if wants_stdin {
            if let Some(stdin) = stdin {
                for chunk in stdin.chunks(CHUNK_SIZE) {
                    channel.send(Frame::binary(chunk.to_vec())).await?;
                }
            }
            channel.send(Frame::end_of_stream()).await?;
            channel.flush().await?;
        }

        loop {
            match channel.next().await {
                Some(Ok(Frame::Text(text))) => {
                    let line: Line = serde_json::from_str(&text)
                        .map_err(|e| WorkerError::Protocol(format!("bad log line: {e}")))?;
                    if line.stream == Stream::Meta {
                        if line.text == "success" {
                            return Ok(());
                        }
                        on_line(Line::new(Stream::Stderr, line.text.clone()));
                        return Err(WorkerError::CommandFailed(line.text));
                    }
                    on_line(line);
                }
                Some(Ok(_)) => {
                    return Err(WorkerError::Protocol(
                        "unexpected binary frame in command output".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(WorkerError::Protocol(
                        "command stream ended without a meta line".to_string(),
                    ))
                }
            }
        }
    }
}
