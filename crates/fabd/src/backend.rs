//! Session backends: how the coordinator reaches a build manager.

use async_trait::async_trait;
use std::sync::Arc;

use fab_managerd::{serve_session, ManagerDeps};
use fab_manager::{FramedChannel, SessionBackend};
use fab_proto::{framed, FrameCodec};

/// Connects to a remote `fab-managerd` over TCP.
pub struct RemoteBackend {
    addr: String,
    max_frame: usize,
}

impl RemoteBackend {
    /// Accepts `host:port` or `tcp://host:port`.
    pub fn new(manager: &str, max_frame: usize) -> eyre::Result<Self> {
        let addr = manager.trim();
        let addr = addr.strip_prefix("tcp://").unwrap_or(addr);
        if addr.contains("://") {
            eyre::bail!("unsupported manager scheme (expected tcp:// or host:port): {manager}");
        }
        Ok(RemoteBackend {
            addr: addr.to_string(),
            max_frame,
        })
    }
}

#[async_trait]
impl SessionBackend for RemoteBackend {
    async fn connect(&self) -> eyre::Result<FramedChannel> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        Ok(framed(stream, FrameCodec::with_max_frame(self.max_frame)))
    }
}

/// Runs the manager engine in-process; each session gets a fresh duplex
/// pipe with `serve_session` on the far end.
pub struct EmbeddedBackend {
    deps: Arc<ManagerDeps>,
    max_frame: usize,
}

impl EmbeddedBackend {
    pub fn new(deps: Arc<ManagerDeps>, max_frame: usize) -> Self {
        EmbeddedBackend { deps, max_frame }
    }
}

#[async_trait]
impl SessionBackend for EmbeddedBackend {
    async fn connect(&self) -> eyre::Result<FramedChannel> {
        let (client, server) = tokio::io::duplex(self.max_frame + 64);
        let deps = self.deps.clone();
        let codec = FrameCodec::with_max_frame(self.max_frame);
        let server_codec = codec.clone();
        tokio::spawn(async move {
            serve_session(framed(server, server_codec), deps).await;
        });
        Ok(framed(client, codec))
    }
}
