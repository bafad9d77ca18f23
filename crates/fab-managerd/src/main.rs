//! Build manager daemon.

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fab_managerd::{serve_session, ManagerDeps, SessionLayout};
use fab_proto::{framed, FrameCodec, KeyAllowList};
use fab_worker::{ContainerPlatform, LocalProcessPlatform, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "fab-managerd", about = "fab build manager")]
struct Args {
    /// Address for build session connections.
    #[arg(long, default_value = "0.0.0.0:8440")]
    listen: String,

    /// Address for the plain-HTTP status endpoint.
    #[arg(long, default_value = "0.0.0.0:80")]
    status_listen: String,

    /// PEM file with the public keys allowed to request builds.
    #[arg(long)]
    authkeys: Utf8PathBuf,

    /// Cluster namespace to create workers in.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Worker pod start timeout, in seconds.
    #[arg(long, default_value_t = 600)]
    start_timeout: u64,

    /// Worker agent binary for the local process platform.
    #[arg(long, default_value = "fab-workerd")]
    agent_bin: Utf8PathBuf,

    /// Scratch directory for local worker secrets.
    #[arg(long, default_value = "/var/lib/fab/workers")]
    worker_dir: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fab_managerd=info")),
        )
        .init();

    let args = Args::parse();

    let pem = std::fs::read_to_string(&args.authkeys)
        .wrap_err_with(|| format!("failed to read {}", args.authkeys))?;
    let allow = KeyAllowList::from_pem(&pem).wrap_err("failed to parse auth keys")?;

    std::fs::create_dir_all(&args.worker_dir)
        .wrap_err_with(|| format!("failed to create {}", args.worker_dir))?;
    let platform: Arc<dyn ContainerPlatform> = Arc::new(LocalProcessPlatform::new(
        args.agent_bin.clone(),
        args.worker_dir.clone(),
    ));
    info!(namespace = %args.namespace, "worker platform ready");

    let cancel = CancellationToken::new();
    let deps = Arc::new(ManagerDeps {
        allow,
        platform,
        worker: WorkerConfig {
            start_timeout: Duration::from_secs(args.start_timeout),
            ..WorkerConfig::default()
        },
        layout: SessionLayout::default(),
        cancel: cancel.clone(),
    });

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            sigterm.recv().await;
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    {
        let app = axum::Router::new().route("/status", axum::routing::get(|| async { "online" }));
        let listener = tokio::net::TcpListener::bind(&args.status_listen)
            .await
            .wrap_err("failed to bind status listener")?;
        info!(addr = %listener.local_addr()?, "status endpoint up");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .wrap_err("failed to bind session listener")?;
    info!(addr = %listener.local_addr()?, "accepting build sessions");

    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!(%peer, "new build session");

        let deps = deps.clone();
        tokio::spawn(async move {
            serve_session(framed(socket, FrameCodec::new()), deps).await;
        });
    }

    info!("shutdown complete");
    Ok(())
}
