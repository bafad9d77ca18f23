//! End-to-end build job flow against a scripted in-process manager.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{SinkExt, StreamExt};
use rsa::RsaPrivateKey;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use fab_buildlog::{Line, Stream};
use fab_graph::{Job, ShouldRun};
use fab_manager::{
    build_jobs, AsyncDuplex, BuildContext, BuildJob, FramedChannel, LogProvider, RecipeIndex,
    SessionBackend, SessionLog, StoreOutputHandler,
};
use fab_proto::{BuildRequest, Frame, FrameCodec, SignedEnvelope, SignedRequest};
use fab_recipe::{Arch, BuildSpec, Loader, MakefileEmitter, MultiLoader, RECIPE_FILE_NAME};
use fab_store::{ArtifactKey, ArtifactStore, BuildCache, HashCache};

#[derive(Clone, Copy, PartialEq)]
enum ManagerScript {
    Succeed,
    Fail,
}

struct DuplexBackend(ManagerScript);

#[async_trait]
impl SessionBackend for DuplexBackend {
    async fn connect(&self) -> eyre::Result<FramedChannel> {
        let (client, server) = tokio::io::duplex(1 << 22);
        let script = self.0;
        tokio::spawn(async move {
            fake_manager(server, script).await;
        });
        Ok(Framed::new(
            Box::new(client) as Box<dyn AsyncDuplex>,
            FrameCodec::new(),
        ))
    }
}

/// Plays the manager's half of the session protocol.
async fn fake_manager(stream: DuplexStream, script: ManagerScript) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // signed build request
    let Some(Ok(Frame::Text(raw))) = framed.next().await else {
        panic!("expected build request frame");
    };
    let request: SignedRequest<BuildRequest> =
        SignedEnvelope::verify(&raw).expect("request must verify");
    let spec: BuildSpec = request.request.pkgen;

    // dependency tar (non-bootstrap only)
    if !spec.builder.is_bootstrap() {
        let Some(Ok(Frame::Binary(dep_tar))) = framed.next().await else {
            panic!("expected dependency tar");
        };
        let names = tar_names(&dep_tar);
        assert!(names.contains(&"./inst.list".to_string()));
        assert!(names.contains(&"./base-build.tar.gz".to_string()));
    }

    // source tar
    let Some(Ok(Frame::Binary(source_tar))) = framed.next().await else {
        panic!("expected source tar");
    };
    let names = tar_names(&source_tar);
    assert!(names.contains(&"Makefile".to_string()));
    assert!(names.contains(&"hello.patch".to_string()));

    match script {
        ManagerScript::Succeed => {
            send_line(&mut framed, Stream::Build, "worker ready").await;
            send_line(&mut framed, Stream::Stdout, "compiling hello").await;

            let mut builder = tar::Builder::new(Vec::new());
            let data = b"built artifact";
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "hello.tar.gz", &data[..]).unwrap();
            let output = builder.into_inner().unwrap();
            framed.send(Frame::binary(output)).await.unwrap();

            send_line(&mut framed, Stream::Meta, "success").await;
        }
        ManagerScript::Fail => {
            send_line(&mut framed, Stream::Stderr, "make: *** [all] Error 2").await;
            send_line(&mut framed, Stream::Meta, "error: exit status 2").await;
        }
    }
}

async fn send_line(framed: &mut Framed<DuplexStream, FrameCodec>, stream: Stream, text: &str) {
    let line = Line::new(stream, text);
    framed
        .send(Frame::text(serde_json::to_string(&line).unwrap()))
        .await
        .unwrap();
}

fn tar_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

struct VecLogProvider(Arc<Mutex<Vec<Line>>>);
struct VecLog(Arc<Mutex<Vec<Line>>>);

#[async_trait]
impl LogProvider for VecLogProvider {
    async fn open(&self, _info: &fab_store::BuildInfo) -> eyre::Result<Box<dyn SessionLog>> {
        Ok(Box::new(VecLog(self.0.clone())))
    }
}

#[async_trait]
impl SessionLog for VecLog {
    async fn log(&self, line: Line) -> eyre::Result<()> {
        self.0.lock().unwrap().push(line);
        Ok(())
    }

    async fn close(self: Box<Self>) -> eyre::Result<()> {
        Ok(())
    }
}

struct StubMakefile;

impl MakefileEmitter for StubMakefile {
    fn render(&self, spec: &BuildSpec) -> std::io::Result<Vec<u8>> {
        Ok(format!("# {}\n", spec.version).into_bytes())
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    ctx: Arc<BuildContext>,
    lines: Arc<Mutex<Vec<Line>>>,
    store: ArtifactStore,
    recipes: Utf8PathBuf,
}

fn arch() -> Arch {
    Arch::parse("x86_64").unwrap()
}

async fn fixture(script: ManagerScript) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

    let recipes = root.join("recipes");
    write_recipe(
        &recipes,
        "base-build",
        "packages:\n  base-build: {}\nversion: 1.0.0\nscript: [make]",
    );
    write_recipe(
        &recipes,
        "hello",
        "packages:\n  hello: {}\nversion: 2.10\nbuild: 1\nscript: [make]\nsources:\n  - file:///hello.patch",
    );
    std::fs::write(recipes.join("hello/hello.patch"), b"patch v1").unwrap();

    let store = ArtifactStore::new(root.join("out"));
    store.init().await.unwrap();
    // seed the dependency artifact
    store
        .put(&ArtifactKey::new("base-build", arch(), false), &b"base"[..])
        .await
        .unwrap();

    let build_cache = BuildCache::new(root.join("cache"));
    build_cache.init().await.unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let ctx = Arc::new(BuildContext {
        index: Arc::new(RecipeIndex::scan(&recipes).unwrap()),
        store: Arc::new(store.clone()),
        hash_cache: Arc::new(HashCache::new(store.clone())),
        build_cache: Arc::new(build_cache),
        base_loader: Arc::new(MultiLoader::new(Vec::new())) as Arc<dyn Loader>,
        makefile: Arc::new(StubMakefile),
        backend: Arc::new(DuplexBackend(script)),
        logs: Arc::new(VecLogProvider(lines.clone())),
        output: Arc::new(StoreOutputHandler(store.clone())),
        signing_key: Arc::new(RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()),
        max_buffer: 16 << 20,
        info_callback: None,
    });

    Fixture {
        _tmp: tmp,
        ctx,
        lines,
        store,
        recipes,
    }
}

fn write_recipe(root: &Utf8Path, dir: &str, yaml: &str) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(RECIPE_FILE_NAME), yaml).unwrap();
}

fn hello_job(f: &Fixture) -> BuildJob {
    let entry = f.ctx.index.get("hello").unwrap().clone();
    BuildJob::new(f.ctx.clone(), entry, arch(), false)
}

#[tokio::test]
async fn successful_build_stores_artifact_and_caches() {
    let f = fixture(ManagerScript::Succeed).await;
    let job = hello_job(&f);

    assert_eq!(job.name(), "hello:x86_64");
    assert_eq!(
        job.dependencies().unwrap(),
        vec!["base-build:x86_64".to_string()]
    );
    assert_eq!(job.should_run().await.unwrap(), ShouldRun::Run);

    job.run(CancellationToken::new()).await.unwrap();

    // output landed under the build's key
    let key = ArtifactKey::new("hello", arch(), false);
    let mut artifact = f.store.get(&key).await.unwrap();
    let mut data = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut artifact.data, &mut data)
        .await
        .unwrap();
    assert_eq!(data, b"built artifact");

    // the session log captured worker output, in order
    let lines = f.lines.lock().unwrap().clone();
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["worker ready", "compiling hello"]);

    // identical inputs now short-circuit
    assert_eq!(job.should_run().await.unwrap(), ShouldRun::SkipCached);
}

#[tokio::test]
async fn source_mutation_invalidates_cache() {
    let f = fixture(ManagerScript::Succeed).await;
    let job = hello_job(&f);

    job.run(CancellationToken::new()).await.unwrap();
    assert_eq!(job.should_run().await.unwrap(), ShouldRun::SkipCached);

    std::fs::write(f.recipes.join("hello/hello.patch"), b"patch v2").unwrap();
    assert_eq!(job.should_run().await.unwrap(), ShouldRun::Run);
}

#[tokio::test]
async fn worker_failure_is_recorded_in_the_cache() {
    let f = fixture(ManagerScript::Fail).await;
    let job = hello_job(&f);

    let err = job.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("exit status 2"), "got: {err}");

    // a rerun with identical inputs fails from cache, with the same text
    match job.should_run().await.unwrap() {
        ShouldRun::FailCached(message) => assert!(message.contains("exit status 2")),
        other => panic!("expected cached failure, got {other:?}"),
    }

    // no artifact was stored
    assert!(!f.store.contains(&ArtifactKey::new("hello", arch(), false)).await);
}

#[tokio::test]
async fn bootstrap_jobs_have_no_dependencies() {
    let f = fixture(ManagerScript::Succeed).await;
    write_recipe(
        &f.recipes,
        "musl",
        "packages:\n  musl: {}\nversion: 1.1.22\nscript: [make]\nbuilder: bootstrap",
    );
    let index = Arc::new(RecipeIndex::scan(&f.recipes).unwrap());
    let entry = index.get("musl").unwrap().clone();
    let ctx = Arc::new(BuildContext {
        index,
        store: f.ctx.store.clone(),
        hash_cache: f.ctx.hash_cache.clone(),
        build_cache: f.ctx.build_cache.clone(),
        base_loader: f.ctx.base_loader.clone(),
        makefile: f.ctx.makefile.clone(),
        backend: f.ctx.backend.clone(),
        logs: f.ctx.logs.clone(),
        output: f.ctx.output.clone(),
        signing_key: f.ctx.signing_key.clone(),
        max_buffer: f.ctx.max_buffer,
        info_callback: None,
    });

    let boot = BuildJob::new(ctx.clone(), entry.clone(), arch(), true);
    assert_eq!(boot.name(), "musl:x86_64-bootstrap");
    assert_eq!(boot.dependencies().unwrap(), Vec::<String>::new());

    let plain = BuildJob::new(ctx, entry, arch(), false);
    assert_eq!(plain.name(), "musl:x86_64");
    // downgraded form still resolves its dependency closure
    assert!(plain
        .dependencies()
        .unwrap()
        .contains(&"base-build:x86_64".to_string()));
}

#[tokio::test]
async fn graph_contains_bootstrap_variants_and_all() {
    let f = fixture(ManagerScript::Succeed).await;
    write_recipe(
        &f.recipes,
        "musl",
        "packages:\n  musl: {}\nversion: 1.1.22\nscript: [make]\nbuilder: bootstrap",
    );
    let ctx = Arc::new(BuildContext {
        index: Arc::new(RecipeIndex::scan(&f.recipes).unwrap()),
        store: f.ctx.store.clone(),
        hash_cache: f.ctx.hash_cache.clone(),
        build_cache: f.ctx.build_cache.clone(),
        base_loader: f.ctx.base_loader.clone(),
        makefile: f.ctx.makefile.clone(),
        backend: f.ctx.backend.clone(),
        logs: f.ctx.logs.clone(),
        output: f.ctx.output.clone(),
        signing_key: f.ctx.signing_key.clone(),
        max_buffer: f.ctx.max_buffer,
        info_callback: None,
    });

    let jobs = build_jobs(&ctx, &[arch()]);
    let names: Vec<String> = jobs.iter().map(|j| j.name()).collect();
    assert!(names.contains(&"base-build:x86_64".to_string()));
    assert!(names.contains(&"hello:x86_64".to_string()));
    assert!(names.contains(&"musl:x86_64".to_string()));
    assert!(names.contains(&"musl:x86_64-bootstrap".to_string()));
    assert!(names.contains(&"all".to_string()));

    // "all" depends on every build job
    let all = jobs.iter().find(|j| j.name() == "all").unwrap();
    let deps = all.dependencies().unwrap();
    assert_eq!(deps.len(), names.len() - 1);
}
