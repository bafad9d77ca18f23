//! fab-workerd: the worker agent.
//!
//! Runs inside the ephemeral worker container. Serves authenticated file
//! and command endpoints over framed TLS, plus a plain-HTTP readiness
//! endpoint.

pub mod service;

pub use service::{serve_connection, AgentState};
