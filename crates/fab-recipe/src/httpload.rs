//! HTTP(S) source loader using hyper.
//!
//! `https` sources stream straight through. Plain `http` sources are only
//! accepted when the URL carries a `sha256sum` query parameter; those are
//! buffered in memory (bounded) and verified before use.

use async_trait::async_trait;
use futures::TryStreamExt;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tokio_util::io::StreamReader;
use url::Url;

use crate::loader::{read_bounded, Loader, LoaderError, Source};

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Get the shared HTTPS client instance.
fn client() -> &'static Client<HttpsConnector, String> {
    static CLIENT: OnceLock<Client<HttpsConnector, String>> = OnceLock::new();
    CLIENT.get_or_init(|| {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native roots")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Client::builder(TokioExecutor::new()).build(https)
    })
}

/// Loads sources over HTTP and HTTPS.
pub struct HttpLoader {
    max_buffer: u64,
}

impl HttpLoader {
    /// `max_buffer` bounds in-memory buffering of integrity-checked
    /// downloads.
    pub fn new(max_buffer: u64) -> Self {
        HttpLoader { max_buffer }
    }
}

#[async_trait]
impl Loader for HttpLoader {
    fn protocols(&self) -> Vec<String> {
        vec!["http".to_string(), "https".to_string()]
    }

    async fn fetch(&self, url: &Url) -> Result<Source, LoaderError> {
        let expected = url
            .query_pairs()
            .find(|(k, _)| k == "sha256sum")
            .map(|(_, v)| v.to_string());

        match url.scheme() {
            "https" => {}
            // an insecure transport requires an integrity hash
            "http" if expected.is_none() => return Err(LoaderError::MissingHash),
            "http" => {}
            other => {
                return Err(LoaderError::UnsupportedProtocol {
                    scheme: other.to_string(),
                })
            }
        }

        let expected = expected
            .map(|hexsum| {
                let sum = hex::decode(&hexsum)
                    .map_err(|e| LoaderError::InvalidHash(e.to_string()))?;
                if sum.len() != 32 {
                    return Err(LoaderError::InvalidHash("wrong length".to_string()));
                }
                Ok(sum)
            })
            .transpose()?;

        let req = Request::builder()
            .uri(url.as_str())
            .body(String::new())
            .map_err(|e| LoaderError::Http(e.to_string()))?;
        let resp = client()
            .request(req)
            .await
            .map_err(|e| LoaderError::Http(e.to_string()))?;

        let status = resp.status();
        if status == hyper::StatusCode::NOT_FOUND {
            return Err(LoaderError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(LoaderError::HttpStatus(status.as_u16()));
        }

        let len = resp
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let reader = body_reader(resp.into_body());

        // hashed downloads buffer and verify before handing out any bytes
        if let Some(expected) = expected {
            let bytes = read_bounded(reader, self.max_buffer).await?;
            let actual = Sha256::digest(&bytes);
            if actual.as_slice() != expected.as_slice() {
                return Err(LoaderError::HashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
            return Ok(Source::from_bytes(bytes));
        }

        Ok(Source {
            len,
            data: Box::new(reader),
        })
    }
}

/// Turn a hyper response body into an `AsyncRead`.
fn body_reader(body: Incoming) -> impl tokio::io::AsyncRead + Send + Unpin {
    let stream = BodyStream::new(body)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(std::io::Error::other);
    // pin the combinator chain so the reader is Unpin
    StreamReader::new(Box::pin(stream))
}
