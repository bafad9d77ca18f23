//! fab-buildlog: build log lines, sinks and durable storage.
//!
//! Everything a build prints travels as tagged [`Line`]s: process output on
//! the stdout/stderr streams, build-system progress on the build stream,
//! and lifecycle tokens on the meta stream (`"success"`, `"failed"`, or
//! free-form error text).

mod line;
mod sink;
mod store;

pub use line::{Line, ParseStreamError, Stream};
pub use sink::{LogSink, SinkError, TracingSink};
pub use store::{DirLogStore, LogStoreError};
