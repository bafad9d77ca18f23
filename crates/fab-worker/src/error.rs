//! Worker lifecycle and RPC errors.

use std::time::Duration;
use thiserror::Error;

use crate::identity::IdentityError;
use fab_proto::ProtoError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("worker pod reported success but should still be running")]
    PrematureSuccess,

    #[error("worker pod failed: {0}")]
    PodFailed(String),

    #[error("timed out after {0:?} waiting for worker start")]
    StartTimeout(Duration),

    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("worker rejected request: {0}")]
    Rejected(String),

    #[error("worker command failed: {0}")]
    CommandFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}
