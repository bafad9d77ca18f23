//! The manager side of the build session protocol.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fab_buildlog::{Line, Stream};
use fab_proto::{
    BuildRequest, CommandRequest, Frame, FramedChannel, KeyAllowList, SignedEnvelope,
};
use fab_recipe::BuildSpec;
use fab_worker::{ContainerPlatform, WorkerConfig, WorkerError, WorkerSession};

/// Filesystem layout and build entry point inside the worker.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    /// Where the source tar unpacks and the build runs.
    pub build_dir: String,
    /// Where dependency archives land before installation.
    pub deps_dir: String,
    /// Root the dependency packages unpack into.
    pub install_root: String,
    /// Command that runs the build, relative to a prepared tree.
    pub build_argv: Vec<String>,
    /// Environment for every command.
    pub env: Vec<(String, String)>,
}

impl Default for SessionLayout {
    fn default() -> Self {
        SessionLayout {
            build_dir: "/root/build".to_string(),
            deps_dir: "/root/pkgs".to_string(),
            install_root: "/".to_string(),
            build_argv: vec![
                "make".to_string(),
                "-C".to_string(),
                "/root/build".to_string(),
            ],
            env: vec![(
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            )],
        }
    }
}

/// Everything the session server needs, loaded once at startup.
pub struct ManagerDeps {
    pub allow: KeyAllowList,
    pub platform: Arc<dyn ContainerPlatform>,
    pub worker: WorkerConfig,
    pub layout: SessionLayout,
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
enum SessionFailure {
    #[error("{0}")]
    Reject(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Serve one build session on `channel`.
pub async fn serve_session(channel: FramedChannel, deps: Arc<ManagerDeps>) {
    let (sink, mut stream) = channel.split();

    // Everything written back goes through one writer task, so log lines
    // and the output archive never interleave mid-frame.
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(write_frames(sink, frame_rx));

    let result = drive(&mut stream, &frame_tx, &deps).await;

    match result {
        Ok(()) => {
            send_meta(&frame_tx, "success");
        }
        Err(e) => {
            warn!(error = %e, "build session failed");
            let text = match e {
                // agent meta lines are already "error: ..." shaped
                SessionFailure::Worker(WorkerError::CommandFailed(text)) => text,
                other => format!("error: {other}"),
            };
            send_meta(&frame_tx, &text);
        }
    }

    drop(frame_tx);
    let _ = writer.await;
}

async fn write_frames(
    mut sink: SplitSink<FramedChannel, Frame>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

fn send_line(tx: &mpsc::UnboundedSender<Frame>, line: &Line) {
    let json = serde_json::to_string(line).expect("lines always encode");
    let _ = tx.send(Frame::Text(json));
}

fn send_meta(tx: &mpsc::UnboundedSender<Frame>, text: &str) {
    send_line(tx, &Line::new(Stream::Meta, text));
}

fn progress(tx: &mpsc::UnboundedSender<Frame>, text: &str) {
    send_line(tx, &Line::new(Stream::Build, text));
}

async fn next_binary(
    stream: &mut futures::stream::SplitStream<FramedChannel>,
    what: &str,
) -> Result<Vec<u8>, SessionFailure> {
    match stream.next().await {
        Some(Ok(Frame::Binary(bytes))) => Ok(bytes.to_vec()),
        Some(Ok(Frame::Text(_))) => Err(SessionFailure::Protocol(format!(
            "expected {what}, got a text frame"
        ))),
        Some(Err(e)) => Err(SessionFailure::Protocol(format!("reading {what}: {e}"))),
        None => Err(SessionFailure::Protocol(format!(
            "connection closed before {what}"
        ))),
    }
}

async fn drive(
    stream: &mut futures::stream::SplitStream<FramedChannel>,
    frames: &mpsc::UnboundedSender<Frame>,
    deps: &Arc<ManagerDeps>,
) -> Result<(), SessionFailure> {
    // Signed build request first.
    let raw = match stream.next().await {
        Some(Ok(Frame::Text(raw))) => raw,
        _ => return Err(SessionFailure::Protocol("missing build request".to_string())),
    };
    let signed = SignedEnvelope::verify::<BuildRequest>(&raw)
        .map_err(|e| SessionFailure::Reject(e.to_string()))?;
    deps.allow
        .check(&signed.public_key)
        .map_err(|e| SessionFailure::Reject(e.to_string()))?;
    let spec: BuildSpec = signed.request.pkgen;

    info!(
        version = %spec.version,
        builder = %spec.builder,
        arch = %spec.host_arch,
        bootstrap = spec.bootstrap,
        "build session accepted"
    );

    // The client sends both tars immediately after the request; they are
    // collected before the worker is provisioned.
    let dep_tar = if spec.builder.is_bootstrap() {
        None
    } else {
        Some(next_binary(stream, "dependency tar").await?)
    };
    let source_tar = next_binary(stream, "source tar").await?;

    progress(frames, "starting worker");
    let session = WorkerSession::start(
        deps.platform.clone(),
        &deps.worker,
        spec.builder,
        &spec.host_arch,
        &deps.cancel,
    )
    .await?;

    let result = run_build(&session, &spec, dep_tar, source_tar, frames, deps).await;

    progress(frames, "tearing down worker");
    session.close().await;
    result
}

async fn run_build(
    session: &WorkerSession,
    spec: &BuildSpec,
    dep_tar: Option<Vec<u8>>,
    source_tar: Vec<u8>,
    frames: &mpsc::UnboundedSender<Frame>,
    deps: &Arc<ManagerDeps>,
) -> Result<(), SessionFailure> {
    let layout = &deps.layout;
    let client = &session.client;

    let run = |argv: Vec<String>| {
        let frames = frames.clone();
        async move {
            let request = CommandRequest {
                argv,
                env: layout.env.iter().cloned().collect(),
                stdin: false,
                disable_stdout: false,
                disable_stderr: false,
            };
            client
                .run(request, None, &move |line| send_line(&frames, &line))
                .await
        }
    };
    let sh = |script: &str| {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]
    };

    client.mkdir(&layout.build_dir, true).await?;

    if let Some(dep_tar) = dep_tar {
        progress(frames, "installing build dependencies");
        client.mkdir(&layout.deps_dir, true).await?;
        let staged = format!("{}/deps.tar", layout.deps_dir);
        client.write_file(&staged, &dep_tar).await?;
        run(sh(&format!(
            "tar -xf {staged} -C {dir} && while read p; do tar -xzf \"{dir}/$p.tar.gz\" -C {root}; done < {dir}/inst.list",
            dir = layout.deps_dir,
            root = layout.install_root,
        )))
        .await?;
    }

    progress(frames, "unpacking sources");
    let staged = format!("{}/src.tar", layout.build_dir);
    client.write_file(&staged, &source_tar).await?;
    run(sh(&format!(
        "tar -xf {staged} -C {dir}",
        dir = layout.build_dir
    )))
    .await?;

    progress(frames, "building");
    run(layout.build_argv.clone()).await?;

    // Collect produced archives into one output frame.
    progress(frames, "collecting outputs");
    let mut builder = tar::Builder::new(Vec::new());
    for package in spec.package_names() {
        let path = format!("{}/tars/{}.tar.gz", layout.build_dir, package);
        let data = client.read_file(&path).await?;
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{package}.tar.gz"), data.as_slice())
            .map_err(|e| SessionFailure::Protocol(format!("output tar: {e}")))?;
    }
    let output = builder
        .into_inner()
        .map_err(|e| SessionFailure::Protocol(format!("output tar: {e}")))?;
    let _ = frames.send(Frame::binary(output));

    Ok(())
}
