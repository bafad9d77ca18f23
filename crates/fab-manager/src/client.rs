//! Client side of the worker session protocol.
//!
//! One session per job run. The client sends the signed build request,
//! the dependency tar and the source tar, while concurrently reading
//! interleaved log lines and the output archive. Success requires both a
//! `meta: "success"` line and a clean end of stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rsa::RsaPrivateKey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fab_buildlog::{Line, Stream};
use fab_proto::{BuildRequest, Frame, FramedChannel, ProtoError, SignedEnvelope};
use fab_recipe::{Loader, MakefileEmitter, SourceTarError};
use fab_store::{ArtifactStore, BuildInfo};

use crate::job::{OutputHandler, SessionLog};
use crate::request::{write_dependency_tar, DepInstall, RequestError};

/// Opens session channels to a build manager.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn connect(&self) -> eyre::Result<FramedChannel>;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("connection closed before completion")]
    UnexpectedEof,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    SourceTar(#[from] SourceTarError),

    #[error("failed to store output {name}: {message}")]
    Output { name: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Everything one session needs.
pub struct SessionParams<'a> {
    pub spec: &'a fab_recipe::BuildSpec,
    pub info: &'a BuildInfo,
    /// Resolved build dependencies, install order.
    pub deps: &'a [DepInstall],
    pub signing_key: &'a RsaPrivateKey,
    pub store: &'a ArtifactStore,
    pub loader: &'a dyn Loader,
    pub makefile: &'a dyn MakefileEmitter,
    pub output: &'a dyn OutputHandler,
    pub log: &'a dyn SessionLog,
    pub max_buffer: u64,
}

/// Drive one build session over `channel`.
pub async fn run_build_session(
    channel: FramedChannel,
    params: SessionParams<'_>,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = drive_session(channel, &params, cancel) => result,
    }
}

async fn drive_session(
    channel: FramedChannel,
    params: &SessionParams<'_>,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let (mut sink, mut stream) = channel.split();

    let send = async {
        let request = BuildRequest {
            pkgen: params.spec.clone(),
        };
        let signed = SignedEnvelope::sign(&request, params.signing_key)?;
        sink.send(Frame::Text(signed)).await?;

        // Bootstrap builds are self-contained; no dependency artifacts.
        if !params.spec.builder.is_bootstrap() {
            let dep_tar = write_dependency_tar(params.store, params.deps).await?;
            sink.send(Frame::binary(dep_tar)).await?;
        }

        let source_tar = fab_recipe::write_source_tar(
            params.spec,
            params.loader,
            params.makefile,
            params.max_buffer,
            cancel,
        )
        .await?;
        sink.send(Frame::binary(source_tar)).await?;
        sink.flush().await?;
        Ok::<(), SessionError>(())
    };

    let recv = async {
        let mut success = false;
        let mut failure: Option<String> = None;

        while let Some(frame) = stream.next().await {
            match frame? {
                Frame::Text(text) => {
                    let line: Line = serde_json::from_str(&text)
                        .map_err(|e| SessionError::Protocol(format!("bad log line: {e}")))?;
                    if line.stream == Stream::Meta {
                        if line.text == "success" {
                            success = true;
                            continue;
                        }
                        // any other meta text is the failure reason
                        failure.get_or_insert(line.text.clone());
                    }
                    if let Err(e) = params.log.log(line).await {
                        // log delivery never fails the build
                        warn!(error = %e, "dropping log line");
                    }
                }
                Frame::Binary(bytes) => {
                    store_outputs(params, &bytes).await?;
                }
            }
        }

        Ok::<(bool, Option<String>), SessionError>((success, failure))
    };

    let (send_result, recv_result) = tokio::join!(send, recv);

    let (success, failure) = recv_result?;
    if let Some(text) = failure {
        return Err(SessionError::WorkerFailed(text));
    }
    if success {
        return Ok(());
    }
    send_result?;
    Err(SessionError::UnexpectedEof)
}

/// Unpack an output archive frame and store each inner package archive.
async fn store_outputs(params: &SessionParams<'_>, bytes: &[u8]) -> Result<(), SessionError> {
    use std::io::Read;

    let mut unpacked = Vec::new();
    {
        let mut archive = tar::Archive::new(bytes);
        let entries = archive
            .entries()
            .map_err(|e| SessionError::Protocol(format!("bad output archive: {e}")))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| SessionError::Protocol(format!("bad output archive: {e}")))?;
            let name = entry
                .path()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| SessionError::Protocol("unnamed output entry".to_string()))?;

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| SessionError::Protocol(format!("bad output archive: {e}")))?;

            unpacked.push((name, data));
        }
    }

    for (name, data) in unpacked {
        params
            .output
            .store(params.info, &name, &data)
            .await
            .map_err(|e| SessionError::Output {
                name: name.clone(),
                message: format!("{e:#}"),
            })?;
    }
    Ok(())
}
