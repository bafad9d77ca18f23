//! fab-proto: wire types for the build and worker protocols.
//!
//! Every request that crosses a trust boundary travels inside a signed
//! envelope; sessions exchange tagged text/binary frames over a
//! length-prefixed codec.

mod envelope;
mod error;
mod frame;
mod requests;

pub use envelope::{KeyAllowList, SignedEnvelope, SignedRequest, API_VERSION};
pub use error::ProtoError;
pub use frame::{framed, AsyncDuplex, Frame, FrameCodec, FramedChannel, DEFAULT_MAX_FRAME};
pub use requests::{
    AgentRequest, AgentResponse, BuildRequest, CommandRequest, MkdirRequest, ReadFileRequest,
    WriteFileRequest,
};
