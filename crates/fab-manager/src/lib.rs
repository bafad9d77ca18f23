//! fab-manager: the build engine's coordinator-side core.
//!
//! Ties the recipe index, input hashing, caches and the worker session
//! protocol together into schedulable [`BuildJob`]s.

mod client;
mod hasher;
mod index;
mod job;
mod name;
mod request;

pub use client::{run_build_session, SessionBackend, SessionError, SessionParams};
pub use fab_proto::{AsyncDuplex, FramedChannel};
pub use hasher::{job_digest, HasherError};
pub use index::{IndexError, RecipeEntry, RecipeIndex};
pub use job::{
    build_jobs, BuildContext, BuildJob, LogProvider, OutputHandler, SessionLog,
    StoreOutputHandler,
};
pub use name::JobName;
pub use request::{write_dependency_tar, DepInstall, RequestError};
