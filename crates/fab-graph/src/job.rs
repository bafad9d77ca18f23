//! Job and event model.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What a job's cache check decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShouldRun {
    /// Inputs changed; run the job.
    Run,
    /// A previous run with identical inputs succeeded; skip.
    SkipCached,
    /// A previous run with identical inputs failed; fail without running.
    FailCached(String),
}

/// A schedulable unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    /// Unique job name; this is the node identity in the graph.
    fn name(&self) -> String;

    /// Names of jobs that must finish successfully first.
    ///
    /// An error here (typically a captured preprocessing failure) is
    /// surfaced when the job is dequeued: the job fails with it, without
    /// running.
    fn dependencies(&self) -> Result<Vec<String>, String>;

    /// Consult caches to decide whether the job needs to run.
    async fn should_run(&self) -> eyre::Result<ShouldRun>;

    /// Run the job. Long-running work must observe the token.
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()>;
}

/// Why a job did not finish.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("{0}")]
    Failed(String),

    #[error("cached failure: {0}")]
    CachedFailure(String),

    #[error("dependency {dep} failed")]
    DependencyFailed { dep: String },

    #[error("unknown job {0:?}")]
    UnknownJob(String),

    #[error("dependency cycle involving {0:?}")]
    Cycle(String),

    #[error("cancelled")]
    Cancelled,
}

/// Lifecycle events. For a single job, `Queued` precedes `Started`, which
/// precedes `Finished` or `Errored`; cached jobs skip `Started`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Queued { job: String },
    Started { job: String },
    Finished { job: String, cached: bool },
    Errored { job: String, error: ExecError },
}

impl Event {
    pub fn job(&self) -> &str {
        match self {
            Event::Queued { job }
            | Event::Started { job }
            | Event::Finished { job, .. }
            | Event::Errored { job, .. } => job,
        }
    }
}

/// Receives executor events. Implementations must be cheap; they run on
/// the scheduling path.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &Event);
}

/// Discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: &Event) {}
}
