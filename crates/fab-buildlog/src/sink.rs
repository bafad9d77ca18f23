//! Log sinks.

use async_trait::async_trait;
use thiserror::Error;

use crate::line::{Line, Stream};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("log receiver is gone")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Receives log lines, in order.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, line: Line) -> Result<(), SinkError>;
}

/// Emits lines as tracing events. Never fails.
pub struct TracingSink {
    /// Shown as the `job` field on every event.
    pub job: String,
}

#[async_trait]
impl LogSink for TracingSink {
    async fn log(&self, line: Line) -> Result<(), SinkError> {
        match line.stream {
            Stream::Stderr | Stream::Meta => {
                tracing::warn!(job = %self.job, stream = %line.stream, "{}", line.text);
            }
            _ => {
                tracing::info!(job = %self.job, stream = %line.stream, "{}", line.text);
            }
        }
        Ok(())
    }
}
