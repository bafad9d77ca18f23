//! The container-platform interface.
//!
//! The build engine only needs five operations from the cluster; the
//! concrete client (and its API machinery) lives outside the engine.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::WorkerError;
use fab_recipe::{Arch, Builder};

/// Pod lifecycle phases, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PodStatus {
    pub phase: PodPhase,
    /// Platform-provided detail, present for failures.
    pub message: Option<String>,
    /// Address the worker serves on, once running.
    pub addr: Option<String>,
}

/// A secret to create before launching a pod.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    pub name_prefix: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// A worker pod to launch.
#[derive(Debug, Clone)]
pub struct PodSpec {
    pub name_prefix: String,
    pub image: String,

    /// Node architecture selector, in platform naming.
    pub node_arch: String,

    /// Secret mounted read-only at the worker's secret path.
    pub secret_name: String,

    /// Docker builds additionally get the host container socket.
    pub mount_container_socket: bool,
}

/// Worker image names per builder class.
#[derive(Debug, Clone)]
pub struct WorkerImages {
    pub default: String,
    pub bootstrap: String,
}

impl Default for WorkerImages {
    fn default() -> Self {
        WorkerImages {
            default: "fab/worker".to_string(),
            bootstrap: "fab/worker:bootstrap".to_string(),
        }
    }
}

/// Derive the pod spec for a build.
pub fn pod_spec_for(
    builder: Builder,
    host_arch: &Arch,
    secret_name: &str,
    images: &WorkerImages,
) -> PodSpec {
    let (image, mount_container_socket) = match builder {
        Builder::Bootstrap => (images.bootstrap.clone(), false),
        Builder::Docker => (images.default.clone(), true),
        Builder::Default => (images.default.clone(), false),
    };
    PodSpec {
        name_prefix: "fab-worker".to_string(),
        image,
        node_arch: host_arch.node_name().to_string(),
        secret_name: secret_name.to_string(),
        mount_container_socket,
    }
}

/// Minimal cluster surface the lifecycle manager drives.
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Create a secret; returns its generated name.
    async fn create_secret(&self, spec: SecretSpec) -> Result<String, WorkerError>;

    /// Launch a pod; returns its generated name.
    async fn create_pod(&self, spec: PodSpec) -> Result<String, WorkerError>;

    async fn pod_status(&self, name: &str) -> Result<PodStatus, WorkerError>;

    async fn delete_pod(&self, name: &str) -> Result<(), WorkerError>;

    async fn delete_secret(&self, name: &str) -> Result<(), WorkerError>;
}
