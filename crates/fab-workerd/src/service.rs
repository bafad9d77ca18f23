//! Agent endpoints.
//!
//! One connection carries one request. The first frame is the signed
//! request; what follows depends on the endpoint. Authentication matches
//! the request's public key against the mounted allow key.

use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fab_buildlog::{Line, LogSink, Stream, TracingSink};
use fab_proto::{
    AgentRequest, AgentResponse, CommandRequest, Frame, FramedChannel, KeyAllowList, ProtoError,
    SignedEnvelope,
};

/// File content chunk size on the wire.
const CHUNK_SIZE: usize = 1 << 20;

/// Process-wide agent state, loaded once at startup.
pub struct AgentState {
    pub allow: KeyAllowList,
    /// Server-wide shutdown token.
    pub cancel: CancellationToken,
}

/// Serve one connection: authenticate the request, run the endpoint.
pub async fn serve_connection(mut channel: FramedChannel, state: Arc<AgentState>) {
    let request = match read_request(&mut channel, &state).await {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "rejecting request");
            let _ = channel
                .send(response_frame(&AgentResponse::error(e.to_string())))
                .await;
            return;
        }
    };

    let result = match request {
        AgentRequest::Mkdir(req) => handle_mkdir(&mut channel, req).await,
        AgentRequest::Write(req) => handle_write(&mut channel, req, &state).await,
        AgentRequest::Read(req) => handle_read(&mut channel, req, &state).await,
        AgentRequest::Run(req) => handle_run(&mut channel, req, &state).await,
    };

    if let Err(e) = result {
        warn!(error = %e, "request failed");
    }
    let _ = channel.close().await;
}

async fn read_request(
    channel: &mut FramedChannel,
    state: &AgentState,
) -> Result<AgentRequest, ProtoError> {
    let raw = match channel.next().await {
        Some(Ok(Frame::Text(raw))) => raw,
        Some(Ok(_)) => {
            return Err(ProtoError::Unauthorised(
                "first frame must be a signed request".to_string(),
            ))
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(ProtoError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no request",
            )))
        }
    };

    let signed = SignedEnvelope::verify::<AgentRequest>(&raw)?;
    state.allow.check(&signed.public_key)?;
    Ok(signed.request)
}

fn response_frame(response: &AgentResponse) -> Frame {
    Frame::text(serde_json::to_string(response).expect("response always encodes"))
}

async fn handle_mkdir(
    channel: &mut FramedChannel,
    req: fab_proto::MkdirRequest,
) -> Result<(), ProtoError> {
    debug!(dir = %req.dir, parent = req.parent, "mkdir");
    let result = if req.parent {
        tokio::fs::create_dir_all(&req.dir).await
    } else {
        tokio::fs::create_dir(&req.dir).await
    };
    let response = match result {
        Ok(()) => AgentResponse::ok(),
        Err(e) => AgentResponse::error(format!("mkdir {}: {e}", req.dir)),
    };
    channel.send(response_frame(&response)).await
}

async fn handle_write(
    channel: &mut FramedChannel,
    req: fab_proto::WriteFileRequest,
    state: &AgentState,
) -> Result<(), ProtoError> {
    debug!(path = %req.path, "write file");
    let mut file = match tokio::fs::File::create(&req.path).await {
        Ok(file) => file,
        Err(e) => {
            // drain the body so the peer is not stuck writing
            while let Some(Ok(frame)) = channel.next().await {
                if frame.is_end_of_stream() {
                    break;
                }
            }
            return channel
                .send(response_frame(&AgentResponse::error(format!(
                    "open {}: {e}",
                    req.path
                ))))
                .await;
        }
    };

    loop {
        let frame = tokio::select! {
            _ = state.cancel.cancelled() => return Ok(()),
            frame = channel.next() => frame,
        };
        match frame {
            Some(Ok(frame)) if frame.is_end_of_stream() => break,
            Some(Ok(Frame::Binary(chunk))) => {
                if let Err(e) = file.write_all(&chunk).await {
                    return channel
                        .send(response_frame(&AgentResponse::error(format!(
                            "write {}: {e}",
                            req.path
                        ))))
                        .await;
                }
            }
            Some(Ok(Frame::Text(_))) => {
                return channel
                    .send(response_frame(&AgentResponse::error(
                        "unexpected text frame in file body",
                    )))
                    .await;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }

    let response = match file.flush().await.and(file.sync_all().await) {
        Ok(()) => AgentResponse::ok(),
        Err(e) => AgentResponse::error(format!("flush {}: {e}", req.path)),
    };
    channel.send(response_frame(&response)).await
}

async fn handle_read(
    channel: &mut FramedChannel,
    req: fab_proto::ReadFileRequest,
    state: &AgentState,
) -> Result<(), ProtoError> {
    debug!(path = %req.path, "read file");
    let mut file = match tokio::fs::File::open(&req.path).await {
        Ok(file) => file,
        Err(e) => {
            return channel
                .send(response_frame(&AgentResponse::error(format!(
                    "open {}: {e}",
                    req.path
                ))))
                .await;
        }
    };

    channel.send(response_frame(&AgentResponse::ok())).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            _ = state.cancel.cancelled() => return Ok(()),
            n = tokio::io::AsyncReadExt::read(&mut file, &mut buf) => n?,
        };
        if n == 0 {
            break;
        }
        channel.send(Frame::binary(buf[..n].to_vec())).await?;
    }
    channel.send(Frame::end_of_stream()).await?;
    channel.flush().await
}

async fn handle_run(
    channel: &mut FramedChannel,
    req: CommandRequest,
    state: &AgentState,
) -> Result<(), ProtoError> {
    debug!(argv = ?req.argv, "run command");
    if req.argv.is_empty() {
        return send_meta(channel, "error: empty argv").await;
    }

    let mut cmd = tokio::process::Command::new(&req.argv[0]);
    cmd.args(&req.argv[1..])
        .current_dir("/")
        // only the supplied environment, in map (sorted) order
        .env_clear()
        .envs(req.env.iter())
        .stdin(if req.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return send_meta(channel, &format!("error: spawn {}: {e}", req.argv[0])).await,
    };

    // Command output also goes to the agent's own log, like any daemon.
    let local_log = TracingSink {
        job: req.argv.join(" "),
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<Line>();

    if !req.disable_stdout {
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, Stream::Stdout, line_tx.clone());
        }
    }
    if !req.disable_stderr {
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, Stream::Stderr, line_tx.clone());
        }
    }
    drop(line_tx);

    let mut stdin_pipe = child.stdin.take();

    // Pump log lines out, stdin chunks in, and watch for exit, all at once.
    let status = loop {
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {
                let _ = child.start_kill();
                let status = child.wait().await;
                break status;
            }
            Some(line) = line_rx.recv() => {
                let _ = local_log.log(line.clone()).await;
                send_line(channel, &line).await?;
            }
            frame = channel.next(), if stdin_pipe.is_some() => {
                match frame {
                    Some(Ok(Frame::Binary(chunk))) if chunk.is_empty() => {
                        stdin_pipe = None; // EOF: close the pipe
                    }
                    Some(Ok(Frame::Binary(chunk))) => {
                        if let Some(stdin) = stdin_pipe.as_mut() {
                            if stdin.write_all(&chunk).await.is_err() {
                                stdin_pipe = None;
                            }
                        }
                    }
                    _ => stdin_pipe = None,
                }
            }
            status = child.wait() => {
                // flush remaining captured lines before terminating
                while let Some(line) = line_rx.recv().await {
                    let _ = local_log.log(line.clone()).await;
                    send_line(channel, &line).await?;
                }
                break status;
            }
        }
    };

    match status {
        Ok(status) if status.success() => send_meta(channel, "success").await,
        Ok(status) => send_meta(channel, &format!("error: {status}")).await,
        Err(e) => send_meta(channel, &format!("error: wait: {e}")).await,
    }
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: Stream,
    tx: mpsc::UnboundedSender<Line>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(Line::new(stream, text)).is_err() {
                break;
            }
        }
    });
}

async fn send_line(channel: &mut FramedChannel, line: &Line) -> Result<(), ProtoError> {
    channel
        .send(Frame::text(
            serde_json::to_string(line).expect("lines always encode"),
        ))
        .await
}

async fn send_meta(channel: &mut FramedChannel, text: &str) -> Result<(), ProtoError> {
    send_line(channel, &Line::new(Stream::Meta, text)).await?;
    channel.flush().await
}
