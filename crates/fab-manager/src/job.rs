//! Build jobs.
//!
//! One [`BuildJob`] per (recipe × arch × bootstrap?) pair. Jobs carry
//! their preprocessed spec; a preprocessing failure is captured and
//! surfaced when the scheduler dequeues the job.

use async_trait::async_trait;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fab_buildlog::Line;
use fab_graph::{Job, ShouldRun};
use fab_recipe::{Arch, BuildSpec, FileLoader, Loader, MakefileEmitter, MultiLoader};
use fab_store::{
    ArtifactKey, ArtifactStore, BuildCache, BuildCacheEntry, BuildInfo, HashCache,
};

use crate::client::{run_build_session, SessionBackend, SessionParams};
use crate::hasher::job_digest;
use crate::index::{RecipeEntry, RecipeIndex};
use crate::name::JobName;
use crate::request::DepInstall;

/// Implicit dependency of every non-bootstrap build.
const BASE_BUILD: &str = "base-build";

/// A log destination scoped to one build session.
#[async_trait]
pub trait SessionLog: Send + Sync {
    async fn log(&self, line: Line) -> eyre::Result<()>;

    /// Close the session log. Called exactly once, after the session ends.
    async fn close(self: Box<Self>) -> eyre::Result<()>;
}

/// Hands out session logs keyed by build identity.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn open(&self, info: &BuildInfo) -> eyre::Result<Box<dyn SessionLog>>;
}

/// Receives output archives produced by builds.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    async fn store(&self, info: &BuildInfo, file_name: &str, data: &[u8]) -> eyre::Result<()>;
}

/// Stores outputs into an [`ArtifactStore`] under the build's key.
pub struct StoreOutputHandler(pub ArtifactStore);

#[async_trait]
impl OutputHandler for StoreOutputHandler {
    async fn store(&self, info: &BuildInfo, file_name: &str, data: &[u8]) -> eyre::Result<()> {
        let name = file_name.trim_end_matches(".tar.gz");
        let key = ArtifactKey::new(name, info.arch.clone(), info.bootstrap);
        self.0.put(&key, data).await?;
        Ok(())
    }
}

/// Callback run whenever a job's build identity is computed.
pub type InfoCallback = Box<dyn Fn(&str, &BuildInfo) + Send + Sync>;

/// Shared state for all jobs of a run.
pub struct BuildContext {
    pub index: Arc<RecipeIndex>,
    pub store: Arc<ArtifactStore>,
    pub hash_cache: Arc<HashCache>,
    pub build_cache: Arc<BuildCache>,

    /// Loader for remote sources; `file://` is bound per job to the
    /// recipe's directory.
    pub base_loader: Arc<dyn Loader>,
    pub makefile: Arc<dyn MakefileEmitter>,
    pub backend: Arc<dyn SessionBackend>,
    pub logs: Arc<dyn LogProvider>,
    pub output: Arc<dyn OutputHandler>,
    pub signing_key: Arc<RsaPrivateKey>,
    pub max_buffer: u64,

    pub info_callback: Option<InfoCallback>,
}

/// One schedulable package build.
pub struct BuildJob {
    ctx: Arc<BuildContext>,
    entry: Arc<RecipeEntry>,
    arch: Arch,
    bootstrap: bool,
    spec: Option<BuildSpec>,
    preprocess_error: Option<String>,
}

impl BuildJob {
    pub fn new(ctx: Arc<BuildContext>, entry: Arc<RecipeEntry>, arch: Arch, bootstrap: bool) -> Self {
        let (spec, preprocess_error) =
            match entry.recipe.preprocess(arch.clone(), arch.clone(), bootstrap) {
                Ok(spec) => (Some(spec), None),
                Err(e) => {
                    warn!(
                        recipe = %entry.path,
                        %arch,
                        bootstrap,
                        error = %e,
                        "preprocessing failed"
                    );
                    (None, Some(e.to_string()))
                }
            };
        BuildJob {
            ctx,
            entry,
            arch,
            bootstrap,
            spec,
            preprocess_error,
        }
    }

    pub fn job_name(&self) -> JobName {
        JobName::new(self.entry.dir_name(), self.arch.clone(), self.bootstrap)
    }

    fn spec(&self) -> Result<&BuildSpec, String> {
        match (&self.spec, &self.preprocess_error) {
            (Some(spec), _) => Ok(spec),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err("missing build spec".to_string()),
        }
    }

    /// The dependency closure as package names, install order.
    fn dep_closure(&self, spec: &BuildSpec) -> Result<Vec<String>, String> {
        let mut targets = spec.build_dependencies.clone();
        targets.push(BASE_BUILD.to_string());
        self.ctx.index.walk(&targets).map_err(|e| e.to_string())
    }

    /// Whether a dependency resolves to its bootstrap artifact: the dep's
    /// recipe must be a bootstrap one, and the dependent's override map
    /// must not exclude it.
    fn dep_bootstrap(&self, spec: &BuildSpec, package: &str, entry: &RecipeEntry) -> bool {
        entry.recipe.builder == "bootstrap" && !spec.no_bootstrap.get(package).copied().unwrap_or(false)
    }

    /// The job-name dependency list (deduplicated, sorted).
    fn resolved_dep_jobs(&self) -> Result<Vec<JobName>, String> {
        let spec = self.spec()?;
        if spec.builder.is_bootstrap() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for package in self.dep_closure(spec)? {
            let entry = self
                .ctx
                .index
                .lookup(&package)
                .map_err(|e| e.to_string())?;
            jobs.push(JobName::new(
                entry.dir_name(),
                spec.host_arch.clone(),
                self.dep_bootstrap(spec, &package, entry),
            ));
        }
        jobs.sort();
        jobs.dedup();
        Ok(jobs)
    }

    /// Per-package artifacts to upload, install order.
    fn install_list(&self) -> Result<Vec<DepInstall>, String> {
        let spec = self.spec()?;
        if spec.builder.is_bootstrap() {
            return Ok(Vec::new());
        }
        let mut installs = Vec::new();
        for package in self.dep_closure(spec)? {
            let entry = self
                .ctx
                .index
                .lookup(&package)
                .map_err(|e| e.to_string())?;
            let bootstrap = self.dep_bootstrap(spec, &package, entry);
            installs.push(DepInstall {
                key: ArtifactKey::new(package.clone(), spec.host_arch.clone(), bootstrap),
                package,
            });
        }
        Ok(installs)
    }

    /// Compute this job's build identity.
    pub async fn build_info(&self) -> eyre::Result<BuildInfo> {
        let spec = self.spec().map_err(|e| eyre::eyre!("{e}"))?;
        let dep_jobs = self.resolved_dep_jobs().map_err(|e| eyre::eyre!("{e}"))?;
        let hash = job_digest(spec, self.entry.dir(), &dep_jobs, &self.ctx.hash_cache).await?;
        Ok(BuildInfo {
            name: self.entry.dir_name().to_string(),
            arch: self.arch.clone(),
            bootstrap: self.bootstrap,
            hash,
        })
    }
}

#[async_trait]
impl Job for BuildJob {
    fn name(&self) -> String {
        self.job_name().to_string()
    }

    fn dependencies(&self) -> Result<Vec<String>, String> {
        if let Some(error) = &self.preprocess_error {
            return Err(error.clone());
        }
        let jobs = self.resolved_dep_jobs()?;
        Ok(jobs.into_iter().map(|j| j.to_string()).collect())
    }

    async fn should_run(&self) -> eyre::Result<ShouldRun> {
        let info = self.build_info().await?;
        if let Some(callback) = &self.ctx.info_callback {
            callback(&self.name(), &info);
        }

        let (latest, error) = self.ctx.build_cache.check_latest(&info).await?;
        if !latest {
            return Ok(ShouldRun::Run);
        }
        match error {
            None => {
                debug!(job = %self.name(), "cached success");
                Ok(ShouldRun::SkipCached)
            }
            Some(message) => {
                debug!(job = %self.name(), "cached failure");
                Ok(ShouldRun::FailCached(message))
            }
        }
    }

    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let spec = self.spec().map_err(|e| eyre::eyre!("{e}"))?;
        let info = self.build_info().await?;
        let deps = self.install_list().map_err(|e| eyre::eyre!("{e}"))?;

        // file:// sources resolve against this recipe's directory.
        let loader = MultiLoader::new(vec![
            Arc::new(FileLoader::new(self.entry.dir())) as Arc<dyn Loader>,
            self.ctx.base_loader.clone(),
        ]);

        let log = self.ctx.logs.open(&info).await?;
        let channel = self.ctx.backend.connect().await;

        let result = match channel {
            Ok(channel) => {
                run_build_session(
                    channel,
                    SessionParams {
                        spec,
                        info: &info,
                        deps: &deps,
                        signing_key: &self.ctx.signing_key,
                        store: &self.ctx.store,
                        loader: &loader,
                        makefile: &*self.ctx.makefile,
                        output: &*self.ctx.output,
                        log: &*log,
                        max_buffer: self.ctx.max_buffer,
                    },
                    &cancel,
                )
                .await
            }
            Err(e) => Err(crate::client::SessionError::Protocol(format!(
                "failed to reach build manager: {e:#}"
            ))),
        };

        if let Err(e) = log.close().await {
            warn!(job = %self.name(), error = %e, "failed to close session log");
        }

        // A failed build is recorded too, so an identical re-request
        // short-circuits with the same error.
        let entry = BuildCacheEntry {
            info,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.ctx.build_cache.update(&entry).await {
            warn!(job = %self.name(), error = %e, "failed to update build cache");
        }

        result.map_err(|e| eyre::eyre!("{e}"))
    }
}

/// The synthetic job every build depends on.
struct AllJob {
    deps: Vec<String>,
}

#[async_trait]
impl Job for AllJob {
    fn name(&self) -> String {
        "all".to_string()
    }

    fn dependencies(&self) -> Result<Vec<String>, String> {
        Ok(self.deps.clone())
    }

    async fn should_run(&self) -> eyre::Result<ShouldRun> {
        Ok(ShouldRun::Run)
    }

    async fn run(&self, _cancel: CancellationToken) -> eyre::Result<()> {
        Ok(())
    }
}

/// Materialise the job graph: one job per (recipe × requested arch),
/// plus the bootstrap variant for bootstrap recipes, plus `all`.
pub fn build_jobs(ctx: &Arc<BuildContext>, arches: &[Arch]) -> Vec<Arc<dyn Job>> {
    let mut jobs: Vec<Arc<dyn Job>> = Vec::new();
    let mut names = Vec::new();

    for entry in ctx.index.entries() {
        for arch in arches {
            if !entry.recipe.arch.supports(arch) {
                continue;
            }
            let job = BuildJob::new(ctx.clone(), entry.clone(), arch.clone(), false);
            names.push(job.name());
            jobs.push(Arc::new(job));

            if entry.recipe.builder == "bootstrap" {
                let job = BuildJob::new(ctx.clone(), entry.clone(), arch.clone(), true);
                names.push(job.name());
                jobs.push(Arc::new(job));
            }
        }
    }

    jobs.push(Arc::new(AllJob { deps: names }));
    jobs
}
