//! Protocol error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unauthorised: {0}")]
    Unauthorised(String),

    #[error("request key does not match signature key")]
    KeyMismatch,

    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unexpected frame tag {0}")]
    BadFrameTag(u8),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}
