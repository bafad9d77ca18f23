//! Worker session lifecycle.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fab_recipe::{Arch, Builder};

use crate::client::{AgentClient, TlsAgentTransport};
use crate::error::WorkerError;
use crate::identity::WorkerIdentity;
use crate::platform::{pod_spec_for, ContainerPlatform, PodPhase, SecretSpec, WorkerImages};

/// Lifecycle knobs. The start timeout is deliberately configuration, not
/// a constant; ten minutes is the safe default for cold image pulls.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub images: WorkerImages,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    /// RSA key size for minted identities.
    pub identity_bits: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            images: WorkerImages::default(),
            start_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            identity_bits: 4096,
        }
    }
}

/// One live worker: its pod, its secret, and an authenticated client.
///
/// Pod and secret are deleted on [`WorkerSession::close`], regardless of
/// how the session went.
pub struct WorkerSession {
    platform: Arc<dyn ContainerPlatform>,
    pod_name: String,
    secret_name: String,
    pub client: AgentClient,
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("pod_name", &self.pod_name)
            .field("secret_name", &self.secret_name)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl WorkerSession {
    /// Provision a worker for one build: mint an identity, publish it as
    /// a secret, launch the pod, and wait for it to serve.
    pub async fn start(
        platform: Arc<dyn ContainerPlatform>,
        config: &WorkerConfig,
        builder: Builder,
        host_arch: &Arch,
        cancel: &CancellationToken,
    ) -> Result<Self, WorkerError> {
        let bits = config.identity_bits;
        let identity = tokio::task::spawn_blocking(move || WorkerIdentity::mint_with_bits(bits))
            .await
            .map_err(|e| WorkerError::Platform(format!("identity task: {e}")))??;

        let secret_name = platform
            .create_secret(SecretSpec {
                name_prefix: "worker-tls".to_string(),
                data: identity.secret_data(),
            })
            .await?;

        let pod_spec = pod_spec_for(builder, host_arch, &secret_name, &config.images);
        let pod_name = match platform.create_pod(pod_spec).await {
            Ok(name) => name,
            Err(e) => {
                cleanup(&platform, None, Some(&secret_name)).await;
                return Err(e);
            }
        };

        info!(pod = %pod_name, secret = %secret_name, "worker starting");

        let addr = match wait_for_start(&platform, &pod_name, config, cancel).await {
            Ok(addr) => addr,
            Err(e) => {
                cleanup(&platform, Some(&pod_name), Some(&secret_name)).await;
                return Err(e);
            }
        };

        let transport = TlsAgentTransport::new(addr, identity.cert_der.clone());
        let client = AgentClient::new(Arc::new(transport), Arc::new(identity.auth_key.clone()));

        Ok(WorkerSession {
            platform,
            pod_name,
            secret_name,
            client,
        })
    }

    /// Tear the worker down. Deletion failures are logged; they never
    /// override the session result.
    pub async fn close(self) {
        cleanup(
            &self.platform,
            Some(&self.pod_name),
            Some(&self.secret_name),
        )
        .await;
    }
}

async fn cleanup(
    platform: &Arc<dyn ContainerPlatform>,
    pod_name: Option<&str>,
    secret_name: Option<&str>,
) {
    if let Some(name) = pod_name {
        if let Err(e) = platform.delete_pod(name).await {
            warn!(pod = %name, error = %e, "failed to delete worker pod");
        }
    }
    if let Some(name) = secret_name {
        if let Err(e) = platform.delete_secret(name).await {
            warn!(secret = %name, error = %e, "failed to delete worker secret");
        }
    }
}

/// Poll pod phase until it runs, fails, or the budget expires.
async fn wait_for_start(
    platform: &Arc<dyn ContainerPlatform>,
    pod_name: &str,
    config: &WorkerConfig,
    cancel: &CancellationToken,
) -> Result<String, WorkerError> {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            _ = ticker.tick() => {}
        }

        let status = platform.pod_status(pod_name).await?;
        match status.phase {
            PodPhase::Pending => {}
            PodPhase::Running => {
                return status.addr.ok_or_else(|| {
                    WorkerError::Unreachable("running pod has no address".to_string())
                });
            }
            PodPhase::Succeeded => return Err(WorkerError::PrematureSuccess),
            PodPhase::Failed => {
                return Err(WorkerError::PodFailed(
                    status.message.unwrap_or_else(|| "no message".to_string()),
                ))
            }
            PodPhase::Unknown => {
                // transient on some platforms; keep polling
                warn!(pod = %pod_name, "pod phase unknown");
            }
        }

        if started.elapsed() > config.start_timeout {
            return Err(WorkerError::StartTimeout(started.elapsed()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PodSpec, PodStatus};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted platform: pod phases play back in order.
    struct ScriptedPlatform {
        phases: Mutex<Vec<PodStatus>>,
        deleted: Mutex<Vec<String>>,
    }

    impl ScriptedPlatform {
        fn new(phases: Vec<PodStatus>) -> Self {
            ScriptedPlatform {
                phases: Mutex::new(phases),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerPlatform for ScriptedPlatform {
        async fn create_secret(&self, spec: SecretSpec) -> Result<String, WorkerError> {
            assert_eq!(
                spec.data.keys().collect::<Vec<_>>(),
                vec!["auth", "cert", "srvkey"]
            );
            Ok("worker-tls-1".to_string())
        }

        async fn create_pod(&self, spec: PodSpec) -> Result<String, WorkerError> {
            assert_eq!(spec.secret_name, "worker-tls-1");
            Ok("fab-worker-1".to_string())
        }

        async fn pod_status(&self, _name: &str) -> Result<PodStatus, WorkerError> {
            let mut phases = self.phases.lock().unwrap();
            if phases.len() > 1 {
                Ok(phases.remove(0))
            } else {
                Ok(phases[0].clone())
            }
        }

        async fn delete_pod(&self, name: &str) -> Result<(), WorkerError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn delete_secret(&self, name: &str) -> Result<(), WorkerError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn status(phase: PodPhase) -> PodStatus {
        PodStatus {
            phase,
            message: None,
            addr: Some("127.0.0.1:1".to_string()),
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            start_timeout: Duration::from_millis(500),
            identity_bits: 2048,
            ..WorkerConfig::default()
        }
    }

    fn arch() -> Arch {
        Arch::parse("x86_64").unwrap()
    }

    #[tokio::test]
    async fn pending_then_running_succeeds_and_close_tears_down() {
        let platform = Arc::new(ScriptedPlatform::new(vec![
            status(PodPhase::Pending),
            status(PodPhase::Unknown),
            status(PodPhase::Running),
        ]));

        let session = WorkerSession::start(
            platform.clone() as Arc<dyn ContainerPlatform>,
            &fast_config(),
            Builder::Default,
            &arch(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        session.close().await;
        assert_eq!(
            *platform.deleted.lock().unwrap(),
            vec!["fab-worker-1", "worker-tls-1"]
        );
    }

    #[tokio::test]
    async fn premature_success_fails_and_cleans_up() {
        let platform = Arc::new(ScriptedPlatform::new(vec![status(PodPhase::Succeeded)]));

        let err = WorkerSession::start(
            platform.clone() as Arc<dyn ContainerPlatform>,
            &fast_config(),
            Builder::Default,
            &arch(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::PrematureSuccess));
        // cleanup still ran
        assert_eq!(
            *platform.deleted.lock().unwrap(),
            vec!["fab-worker-1", "worker-tls-1"]
        );
    }

    #[tokio::test]
    async fn pod_failure_carries_the_message() {
        let platform = Arc::new(ScriptedPlatform::new(vec![PodStatus {
            phase: PodPhase::Failed,
            message: Some("image pull backoff".to_string()),
            addr: None,
        }]));

        let err = WorkerSession::start(
            platform as Arc<dyn ContainerPlatform>,
            &fast_config(),
            Builder::Default,
            &arch(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::PodFailed(m) if m.contains("image pull backoff")));
    }

    #[tokio::test]
    async fn start_times_out_on_endless_pending() {
        let platform = Arc::new(ScriptedPlatform::new(vec![status(PodPhase::Pending)]));

        let err = WorkerSession::start(
            platform as Arc<dyn ContainerPlatform>,
            &fast_config(),
            Builder::Default,
            &arch(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::StartTimeout(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let platform = Arc::new(ScriptedPlatform::new(vec![status(PodPhase::Pending)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = WorkerSession::start(
            platform as Arc<dyn ContainerPlatform>,
            &fast_config(),
            Builder::Default,
            &arch(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::Cancelled));
    }

    #[test]
    fn secret_data_keys_are_stable() {
        let identity = WorkerIdentity::mint_with_bits(2048).unwrap();
        let data: BTreeMap<String, Vec<u8>> = identity.secret_data();
        assert!(data["cert"].starts_with(b"-----BEGIN CERTIFICATE-----"));
    }
}
