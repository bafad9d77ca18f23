//! fab-graph: bounded-parallel job graph execution.
//!
//! Jobs are nodes in a dependency DAG. The executor runs them in
//! topological order with a bounded worker pool, emits lifecycle events,
//! and poisons the dependents of anything that fails. Job identity is the
//! job name; edges are stored by name, never as object references.

mod executor;
mod job;

#[cfg(test)]
mod tests;

pub use executor::{Executor, RunSummary};
pub use job::{Event, EventSink, ExecError, Job, NullSink, ShouldRun};
