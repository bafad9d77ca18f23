//! Log line model.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The stream a log line belongs to.
///
/// Encoded numerically on the wire and in stored logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Stream {
    /// Process standard output.
    Stdout,
    /// Process standard error.
    Stderr,
    /// Build-system progress messages.
    Build,
    /// Lifecycle tokens: `"success"`, `"failed"`, or error text.
    Meta,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Build => "build",
            Stream::Meta => "meta",
        }
    }
}

impl From<Stream> for u8 {
    fn from(s: Stream) -> u8 {
        match s {
            Stream::Stdout => 1,
            Stream::Stderr => 2,
            Stream::Build => 3,
            Stream::Meta => 4,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid stream {0}")]
pub struct ParseStreamError(pub u8);

impl TryFrom<u8> for Stream {
    type Error = ParseStreamError;

    fn try_from(v: u8) -> Result<Self, ParseStreamError> {
        match v {
            1 => Ok(Stream::Stdout),
            2 => Ok(Stream::Stderr),
            3 => Ok(Stream::Build),
            4 => Ok(Stream::Meta),
            other => Err(ParseStreamError(other)),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of build log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    pub stream: Stream,
}

impl Line {
    pub fn new(stream: Stream, text: impl Into<String>) -> Self {
        Line {
            text: text.into(),
            stream,
        }
    }

    /// The meta line that terminates a successful build.
    pub fn success() -> Self {
        Line::new(Stream::Meta, "success")
    }

    /// Whether this line terminates a session (any meta line does).
    pub fn is_terminal(&self) -> bool {
        self.stream == Stream::Meta
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stream, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_stream_encoding() {
        let line = Line::new(Stream::Stderr, "boom");
        let json = serde_json::to_string(&line).unwrap();
        assert_eq!(json, r#"{"text":"boom","stream":2}"#);

        let back: Line = serde_json::from_str(&json).unwrap();
        assert_eq!(back, line);
    }

    #[test]
    fn invalid_stream_rejected() {
        let err = serde_json::from_str::<Line>(r#"{"text":"x","stream":9}"#);
        assert!(err.is_err());
    }
}
