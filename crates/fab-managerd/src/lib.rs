//! fab-managerd: hosts build sessions.
//!
//! Accepts one framed session per connection: a signed build request,
//! the dependency and source tars, then a worker is provisioned and
//! driven through the build while logs stream back.

pub mod session;

pub use session::{serve_session, ManagerDeps, SessionLayout};
