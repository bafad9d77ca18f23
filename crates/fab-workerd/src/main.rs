//! Worker agent daemon.

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{Context, Result};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fab_proto::{framed, FrameCodec, KeyAllowList};
use fab_workerd::{serve_connection, AgentState};

#[derive(Debug, Parser)]
#[command(name = "fab-workerd", about = "fab build worker agent")]
struct Args {
    /// Address for the TLS agent endpoint.
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: String,

    /// Address for the plain-HTTP status endpoint.
    #[arg(long, default_value = "0.0.0.0:80")]
    status_listen: String,

    /// Directory holding the mounted session secret
    /// (srvkey.pem, cert.pem, auth.pem).
    #[arg(long, default_value = "/srv/secret")]
    secret_dir: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fab_workerd=info")),
        )
        .init();

    let args = Args::parse();

    let cert_pem = std::fs::read_to_string(args.secret_dir.join("cert.pem"))
        .wrap_err("failed to read certificate")?;
    let key_pem = std::fs::read_to_string(args.secret_dir.join("srvkey.pem"))
        .wrap_err("failed to read TLS key")?;
    let auth_pem = std::fs::read_to_string(args.secret_dir.join("auth.pem"))
        .wrap_err("failed to read auth key")?;

    let allow = KeyAllowList::from_pem(&auth_pem).wrap_err("failed to parse auth key")?;
    let tls_config = fab_worker::tls::server_config(&cert_pem, &key_pem)
        .wrap_err("failed to build TLS config")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let cancel = CancellationToken::new();
    let state = Arc::new(AgentState {
        allow,
        cancel: cancel.clone(),
    });

    // SIGTERM initiates cooperative shutdown.
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

    // Readiness endpoint for the platform's probe.
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
        .wrap_err("failed to bind agent listener")?;
    info!(addr = %listener.local_addr()?, "agent listening");

    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            match acceptor.accept(socket).await {
                Ok(stream) => {
                    serve_connection(framed(stream, FrameCodec::new()), state).await;
                }
                Err(e) => warn!(%peer, error = %e, "tls accept failed"),
            }
        });
    }

    info!("shutdown complete");
    Ok(())
}
