//! fabd: the build coordinator.
//!
//! Loads the recipe tree, materialises the job graph, and runs it with
//! bounded parallelism against a build manager (embedded or remote),
//! while serving build status and live logs over HTTP.

mod backend;
mod git;
mod http;
mod logs;
mod makefile;
mod status;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{eyre, Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fab_buildlog::DirLogStore;
use fab_graph::{Event, EventSink, Executor, Job};
use fab_manager::{build_jobs, BuildContext, RecipeIndex, SessionBackend, StoreOutputHandler};
use fab_managerd::{ManagerDeps, SessionLayout};
use fab_proto::KeyAllowList;
use fab_recipe::{Arch, HttpLoader, Loader};
use fab_store::{ArtifactStore, BuildCache, HashCache};
use fab_worker::{ContainerPlatform, LocalProcessPlatform, WorkerConfig};

use crate::backend::{EmbeddedBackend, RemoteBackend};
use crate::http::AppState;
use crate::logs::LogManager;
use crate::makefile::ScriptMakefile;
use crate::status::StatusBoard;

#[derive(Debug, Parser)]
#[command(name = "fabd", about = "fab package build coordinator")]
struct Args {
    /// HTTP listen address for status and logs.
    #[arg(long, default_value = ":80")]
    http: String,

    /// Cluster namespace for worker pods.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Extra public keys (PEM) allowed to request builds from the
    /// embedded manager.
    #[arg(long)]
    authkeys: Option<Utf8PathBuf>,

    /// Remote build manager address. When unset, an embedded manager
    /// with the local process platform is used.
    #[arg(long)]
    manager: Option<String>,

    /// Private key (PEM) for signing build requests.
    #[arg(long)]
    manager_key: Option<Utf8PathBuf>,

    /// Build cache directory.
    #[arg(long, default_value = "cache")]
    cache: Utf8PathBuf,

    /// Artifact output directory.
    #[arg(long, default_value = "output")]
    output: Utf8PathBuf,

    /// Persisted build log directory.
    #[arg(long, default_value = "logs")]
    logs: Utf8PathBuf,

    /// Git repository to sync the recipe tree from.
    #[arg(long)]
    git_repo: Option<String>,

    /// Recipe tree directory.
    #[arg(long, default_value = "recipes")]
    git_dir: Utf8PathBuf,

    /// Architectures to build for (comma separated). Defaults to all
    /// supported ones.
    #[arg(long, value_delimiter = ',')]
    arch: Vec<String>,

    /// Parallel build limit.
    #[arg(long)]
    parallel: Option<usize>,

    /// In-memory buffer limit for sources of unknown size, in bytes.
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    maxbuf: usize,

    /// Shell command to run after a fully successful build.
    #[arg(long)]
    after_build: Option<String>,

    /// Worker agent binary for the embedded manager.
    #[arg(long, default_value = "fab-workerd")]
    agent_bin: Utf8PathBuf,

    /// Worker pod start timeout, in seconds.
    #[arg(long, default_value_t = 600)]
    start_timeout: u64,

    /// Build targets. Defaults to `all`.
    targets: Vec<String>,
}

/// Forwards executor events to the status board and the log.
struct RunEvents {
    board: Arc<StatusBoard>,
}

impl EventSink for RunEvents {
    fn event(&self, event: &Event) {
        match event {
            Event::Queued { job } => info!(%job, "queued"),
            Event::Started { job } => info!(%job, "started"),
            Event::Finished { job, cached } => info!(%job, cached, "finished"),
            Event::Errored { job, error } => warn!(%job, %error, "errored"),
        }
        self.board.event(event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fabd=info,fab_manager=info,fab_managerd=info,fab_worker=info")),
        )
        .init();

    let args = Args::parse();

    if let Some(repo) = &args.git_repo {
        git::sync_recipes(repo, &args.git_dir).await?;
    }

    let arches = resolve_arches(&args.arch)?;
    let targets = if args.targets.is_empty() {
        vec!["all".to_string()]
    } else {
        args.targets.clone()
    };

    // Stores.
    let store = ArtifactStore::new(args.output.clone());
    store.init().await?;
    let build_cache = BuildCache::new(args.cache.clone());
    build_cache.init().await?;
    let log_store = DirLogStore::new(args.logs.clone());
    log_store.init().await?;

    let index = Arc::new(
        RecipeIndex::scan(&args.git_dir)
            .wrap_err_with(|| format!("failed to index {}", args.git_dir))?,
    );
    info!(dirs = index.dirs().len(), "recipe tree indexed");

    let signing_key = Arc::new(load_or_mint_key(args.manager_key.as_deref()).await?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    // Build manager: remote, or embedded on the local process platform.
    let backend: Arc<dyn SessionBackend> = match &args.manager {
        Some(manager) => Arc::new(RemoteBackend::new(manager, args.maxbuf + (16 << 20))?),
        None => {
            let mut allow = KeyAllowList::single(
                signing_key
                    .to_public_key()
                    .to_pkcs1_der()
                    .map_err(|e| eyre!("failed to encode public key: {e}"))?
                    .into_vec(),
            );
            if let Some(path) = &args.authkeys {
                let pem = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("failed to read {path}"))?;
                allow.merge(KeyAllowList::from_pem(&pem)?);
            }

            let worker_dir = args.cache.join("workers");
            std::fs::create_dir_all(&worker_dir)?;
            let platform: Arc<dyn ContainerPlatform> = Arc::new(LocalProcessPlatform::new(
                args.agent_bin.clone(),
                worker_dir,
            ));
            info!(namespace = %args.namespace, "embedded build manager ready");

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
            Arc::new(EmbeddedBackend::new(deps, args.maxbuf + (16 << 20)))
        }
    };

    let log_manager = Arc::new(LogManager::new(log_store));
    let board = Arc::new(StatusBoard::default());

    let hash_cache = Arc::new(HashCache::new(store.clone()));
    let ctx = Arc::new(BuildContext {
        index,
        store: Arc::new(store.clone()),
        hash_cache: hash_cache.clone(),
        build_cache: Arc::new(build_cache),
        base_loader: Arc::new(HttpLoader::new(args.maxbuf as u64)) as Arc<dyn Loader>,
        makefile: Arc::new(ScriptMakefile),
        backend,
        logs: log_manager.clone(),
        output: Arc::new(StoreOutputHandler(store)),
        signing_key,
        max_buffer: args.maxbuf as u64,
        info_callback: Some({
            let board = board.clone();
            Box::new(move |job: &str, info: &fab_store::BuildInfo| {
                board.record_info(job, info);
            })
        }),
    });

    let jobs = build_jobs(&ctx, &arches);
    board.set_jobs(jobs.iter().map(|j| j.name()));
    info!(jobs = jobs.len(), targets = ?targets, "job graph ready");

    // HTTP surface for the duration of the run.
    let app = http::router(AppState {
        logs: log_manager.clone(),
        status: board.clone(),
    });
    let listener = tokio::net::TcpListener::bind(normalize_http_addr(&args.http))
        .await
        .wrap_err("failed to bind http listener")?;
    info!(addr = %listener.local_addr()?, "http surface up");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    // Run.
    hash_cache.bump().await;
    let parallelism = args
        .parallel
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |n| n.get()));
    let events: Arc<dyn EventSink> = Arc::new(RunEvents {
        board: board.clone(),
    });

    let summary = Executor::new(parallelism)
        .run(jobs, &targets, cancel.clone(), events)
        .await
        .map_err(|e| eyre!("failed to start run: {e}"))?;
    hash_cache.prune().await;

    info!(
        built = summary.built,
        cached = summary.cached,
        errored = summary.errored.len(),
        "run complete"
    );

    if !summary.success() {
        for (job, error) in &summary.errored {
            warn!(%job, %error, "job failed");
        }
        return Err(eyre!("{} job(s) failed", summary.errored.len()));
    }

    if let Some(command) = &args.after_build {
        info!(%command, "running after-build hook");
        let status = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .wrap_err("failed to run after-build hook")?;
        if !status.success() {
            return Err(eyre!("after-build hook failed: {status}"));
        }
    }

    Ok(())
}

fn resolve_arches(requested: &[String]) -> Result<Vec<Arch>> {
    if requested.is_empty() {
        return Ok(Arch::all().iter().cloned().collect());
    }
    requested
        .iter()
        .map(|name| Arch::parse(name).map_err(|e| eyre!("{e}")))
        .collect()
}

/// `:80` means every interface, port 80.
fn normalize_http_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Load the signing key, or mint an ephemeral one for embedded runs.
async fn load_or_mint_key(path: Option<&camino::Utf8Path>) -> Result<RsaPrivateKey> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {path}"))?;
            RsaPrivateKey::from_pkcs1_pem(&pem)
                .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
                .map_err(|e| eyre!("failed to parse {path}: {e}"))
        }
        None => {
            info!("minting ephemeral signing key");
            tokio::task::spawn_blocking(|| {
                RsaPrivateKey::new(&mut rand::thread_rng(), 4096)
                    .map_err(|e| eyre!("key generation failed: {e}"))
            })
            .await?
        }
    }
}
