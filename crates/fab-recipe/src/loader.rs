//! Source loaders.
//!
//! A [`Loader`] resolves a source URL into a byte stream. Loaders are
//! scheme-scoped and composed with [`MultiLoader`]; [`BufferLoader`] turns
//! unknown-length streams into bounded in-memory ones so they can be
//! written into tar archives.

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

/// Errors produced while fetching a source.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("unsupported protocol {scheme:?}")]
    UnsupportedProtocol { scheme: String },

    #[error("insecure resource does not carry a sha256sum")]
    MissingHash,

    #[error("invalid source hash: {0}")]
    InvalidHash(String),

    #[error("source hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("source exceeds maximum buffer size ({limit} bytes)")]
    BufferExceeded { limit: u64 },

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("http error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A fetched source: its length if known, and the content stream.
pub struct Source {
    pub len: Option<u64>,
    pub data: Box<dyn AsyncRead + Send + Unpin>,
}

impl Source {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Source {
            len: Some(bytes.len() as u64),
            data: Box::new(Cursor::new(bytes)),
        }
    }
}

/// An async source loader for one or more URL schemes.
#[async_trait]
pub trait Loader: Send + Sync {
    /// URL schemes this loader accepts.
    fn protocols(&self) -> Vec<String>;

    /// Fetch the content behind `url`.
    async fn fetch(&self, url: &Url) -> Result<Source, LoaderError>;
}

/// Dispatches to an inner loader by URL scheme.
///
/// When several loaders claim the same scheme the last one wins.
pub struct MultiLoader {
    loaders: Vec<Arc<dyn Loader>>,
}

impl MultiLoader {
    pub fn new(loaders: Vec<Arc<dyn Loader>>) -> Self {
        MultiLoader { loaders }
    }

    fn loader_for(&self, scheme: &str) -> Option<&Arc<dyn Loader>> {
        self.loaders
            .iter()
            .rev()
            .find(|l| l.protocols().iter().any(|p| p == scheme))
    }
}

#[async_trait]
impl Loader for MultiLoader {
    fn protocols(&self) -> Vec<String> {
        let mut protos: Vec<String> = self.loaders.iter().flat_map(|l| l.protocols()).collect();
        protos.sort();
        protos.dedup();
        protos
    }

    async fn fetch(&self, url: &Url) -> Result<Source, LoaderError> {
        let loader = self
            .loader_for(url.scheme())
            .ok_or_else(|| LoaderError::UnsupportedProtocol {
                scheme: url.scheme().to_string(),
            })?;
        loader.fetch(url).await
    }
}

/// Wraps a loader so every fetch has a known length, buffering streams of
/// unknown size in memory up to `max_buffer` bytes.
pub struct BufferLoader {
    inner: Arc<dyn Loader>,
    max_buffer: u64,
}

impl BufferLoader {
    pub fn new(inner: Arc<dyn Loader>, max_buffer: u64) -> Self {
        BufferLoader { inner, max_buffer }
    }
}

#[async_trait]
impl Loader for BufferLoader {
    fn protocols(&self) -> Vec<String> {
        self.inner.protocols()
    }

    async fn fetch(&self, url: &Url) -> Result<Source, LoaderError> {
        let source = self.inner.fetch(url).await?;
        if source.len.is_some() {
            return Ok(source);
        }
        let bytes = read_bounded(source.data, self.max_buffer).await?;
        Ok(Source::from_bytes(bytes))
    }
}

/// Read a stream to completion, failing once it exceeds `limit` bytes.
pub(crate) async fn read_bounded(
    mut r: impl AsyncRead + Send + Unpin,
    limit: u64,
) -> Result<Vec<u8>, LoaderError> {
    let mut buf = Vec::new();
    let n = (&mut r).take(limit).read_to_end(&mut buf).await?;
    if n as u64 == limit {
        // distinguish "exactly limit" from "over limit" with one more byte
        let mut probe = [0u8; 1];
        if r.read(&mut probe).await? > 0 {
            return Err(LoaderError::BufferExceeded { limit });
        }
    }
    Ok(buf)
}
