//! fab-worker: worker lifecycle management and the agent client.
//!
//! A build session gets a freshly minted TLS identity, a cluster secret
//! carrying it, and an ephemeral worker pod pinned to a matching node.
//! Once the pod reports ready, the [`AgentClient`] drives it over pinned
//! TLS. Pods and secrets are torn down unconditionally when the session
//! ends.

mod client;
mod error;
mod identity;
mod local;
mod platform;
mod starter;
pub mod tls;

pub use client::{AgentClient, AgentTransport, TlsAgentTransport};
pub use error::WorkerError;
pub use identity::{IdentityError, WorkerIdentity};
pub use local::LocalProcessPlatform;
pub use platform::{pod_spec_for, ContainerPlatform, PodPhase, PodSpec, PodStatus, SecretSpec, WorkerImages};
pub use starter::{WorkerConfig, WorkerSession};
