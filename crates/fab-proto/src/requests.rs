//! Request and response bodies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fab_recipe::BuildSpec;

/// A request to the worker agent. The `kind` tag selects the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    Mkdir(MkdirRequest),
    Write(WriteFileRequest),
    Read(ReadFileRequest),
    Run(CommandRequest),
}

/// Make a directory on the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    pub dir: String,

    /// Also create missing parent directories.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parent: bool,
}

/// Write a file on the worker; content follows as binary frames,
/// terminated by an empty one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
}

/// Read a file from the worker; content returns as binary frames,
/// terminated by an empty one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

/// Run a command on the worker.
///
/// Output comes back as log-line frames and ends with a meta line:
/// `"success"` on exit code zero, `"error: ..."` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Argument vector; `argv[0]` is the program.
    pub argv: Vec<String>,

    /// The complete environment for the command. Nothing is inherited;
    /// the map is ordered so the command sees a deterministic environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Forward stdin from the session as binary frames.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdin: bool,

    /// Do not capture stdout as log lines.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_stdout: bool,

    /// Do not capture stderr as log lines.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_stderr: bool,
}

/// Result of a non-streaming agent request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok() -> Self {
        AgentResponse {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentResponse {
            ok: false,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<(), String> {
        if self.ok {
            Ok(())
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

/// A request to build one preprocessed spec. Opens a build session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub pkgen: BuildSpec,
}
