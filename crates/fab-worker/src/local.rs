//! Local-process "cluster" for development and tests.
//!
//! Pods are worker-agent child processes on loopback; secrets are
//! directories of PEM files. Readiness is a TCP connect, like the pod
//! readiness probe in a real cluster.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::WorkerError;
use crate::platform::{ContainerPlatform, PodPhase, PodSpec, PodStatus, SecretSpec};

struct LocalPod {
    child: tokio::process::Child,
    addr: String,
}

/// Runs worker agents as local child processes.
pub struct LocalProcessPlatform {
    agent_bin: Utf8PathBuf,
    root: Utf8PathBuf,
    next_id: AtomicU64,
    secrets: Mutex<HashMap<String, Utf8PathBuf>>,
    pods: Arc<Mutex<HashMap<String, LocalPod>>>,
}

impl LocalProcessPlatform {
    /// `agent_bin` is the worker agent executable; `root` holds secret
    /// directories for the platform's lifetime.
    pub fn new(agent_bin: impl Into<Utf8PathBuf>, root: impl Into<Utf8PathBuf>) -> Self {
        LocalProcessPlatform {
            agent_bin: agent_bin.into(),
            root: root.into(),
            next_id: AtomicU64::new(1),
            secrets: Mutex::new(HashMap::new()),
            pods: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ContainerPlatform for LocalProcessPlatform {
    async fn create_secret(&self, spec: SecretSpec) -> Result<String, WorkerError> {
        let name = self.next_name(&spec.name_prefix);
        let dir = self.root.join(&name);
        tokio::fs::create_dir_all(&dir).await?;
        for (key, value) in &spec.data {
            tokio::fs::write(dir.join(format!("{key}.pem")), value).await?;
        }
        self.secrets.lock().await.insert(name.clone(), dir);
        Ok(name)
    }

    async fn create_pod(&self, spec: PodSpec) -> Result<String, WorkerError> {
        let secret_dir = self
            .secrets
            .lock()
            .await
            .get(&spec.secret_name)
            .cloned()
            .ok_or_else(|| {
                WorkerError::Platform(format!("unknown secret {:?}", spec.secret_name))
            })?;

        // Reserve a loopback port for the agent.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        drop(listener);

        debug!(image = %spec.image, arch = %spec.node_arch, %addr, "spawning local worker");

        let child = tokio::process::Command::new(&self.agent_bin)
            .arg("--listen")
            .arg(&addr)
            .arg("--status-listen")
            .arg("127.0.0.1:0")
            .arg("--secret-dir")
            .arg(secret_dir.as_str())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::Platform(format!("failed to spawn {}: {e}", self.agent_bin))
            })?;

        let name = self.next_name(&spec.name_prefix);
        self.pods
            .lock()
            .await
            .insert(name.clone(), LocalPod { child, addr });
        Ok(name)
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatus, WorkerError> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get_mut(name)
            .ok_or_else(|| WorkerError::Platform(format!("unknown pod {name:?}")))?;

        if let Some(status) = pod
            .child
            .try_wait()
            .map_err(|e| WorkerError::Platform(e.to_string()))?
        {
            let phase = if status.success() {
                PodPhase::Succeeded
            } else {
                PodPhase::Failed
            };
            return Ok(PodStatus {
                phase,
                message: Some(format!("agent exited: {status}")),
                addr: None,
            });
        }

        // Readiness probe: is the agent accepting connections yet?
        match tokio::net::TcpStream::connect(&pod.addr).await {
            Ok(_) => Ok(PodStatus {
                phase: PodPhase::Running,
                message: None,
                addr: Some(pod.addr.clone()),
            }),
            Err(_) => Ok(PodStatus {
                phase: PodPhase::Pending,
                message: None,
                addr: None,
            }),
        }
    }

    async fn delete_pod(&self, name: &str) -> Result<(), WorkerError> {
        let pod = self.pods.lock().await.remove(name);
        if let Some(mut pod) = pod {
            let _ = pod.child.start_kill();
            let _ = pod.child.wait().await;
        }
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), WorkerError> {
        if let Some(dir) = self.secrets.lock().await.remove(name) {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        Ok(())
    }
}
