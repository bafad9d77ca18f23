//! Per-build log distribution.
//!
//! Each live build owns one distributor task keyed by its input digest.
//! The distributor buffers every line, replays the buffer to new
//! subscribers, and forwards live lines with non-blocking sends; a slow
//! subscriber is dropped rather than ever backpressuring the build. When
//! the producer closes, subscribers are ejected and the buffer is
//! persisted, and later readers replay from disk.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use fab_buildlog::{DirLogStore, Line, LogStoreError};
use fab_manager::{LogProvider, SessionLog};
use fab_store::BuildInfo;

/// Capacity of each subscriber's channel. Replay of a longer buffer into
/// a subscriber that is not draining counts as slowness.
const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("no log for {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] LogStoreError),
}

struct SessionHandle {
    subscribe_tx: mpsc::UnboundedSender<mpsc::Sender<Line>>,
}

type SessionMap = Arc<Mutex<HashMap<[u8; 32], SessionHandle>>>;

/// Owns every live log session and the durable store behind them.
pub struct LogManager {
    store: DirLogStore,
    sessions: SessionMap,
}

impl LogManager {
    pub fn new(store: DirLogStore) -> Self {
        LogManager {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a build's log: live if a session exists, replayed
    /// from disk otherwise.
    pub async fn stream(&self, digest: &[u8; 32]) -> Result<LogStream, LogError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(handle) = sessions.get(digest) {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
                if handle.subscribe_tx.send(tx).is_ok() {
                    return Ok(LogStream::Live(rx));
                }
                // session just closed; fall through to disk
            }
        }

        match self.store.load(digest).await {
            Ok(lines) => Ok(LogStream::Replay(lines.into_iter())),
            Err(LogStoreError::NotFound(_)) => Err(LogError::NotFound(hex::encode(digest))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LogProvider for LogManager {
    async fn open(&self, info: &BuildInfo) -> eyre::Result<Box<dyn SessionLog>> {
        let digest = info.hash;
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();

        let store = self.store.clone();
        let task = tokio::spawn(distribute(digest, line_rx, subscribe_rx, store));

        self.sessions
            .lock()
            .await
            .insert(digest, SessionHandle { subscribe_tx });

        Ok(Box::new(SessionWriter {
            digest,
            line_tx: Some(line_tx),
            task: Some(task),
            sessions: self.sessions.clone(),
        }))
    }
}

/// One session's producer handle.
struct SessionWriter {
    digest: [u8; 32],
    line_tx: Option<mpsc::UnboundedSender<Line>>,
    task: Option<tokio::task::JoinHandle<()>>,
    sessions: SessionMap,
}

#[async_trait]
impl SessionLog for SessionWriter {
    async fn log(&self, line: Line) -> eyre::Result<()> {
        if let Some(tx) = &self.line_tx {
            tx.send(line).map_err(|_| eyre::eyre!("log session gone"))?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> eyre::Result<()> {
        // closing the producer channel lets the distributor finish
        self.line_tx.take();
        self.sessions.lock().await.remove(&self.digest);
        if let Some(task) = self.task.take() {
            // wait for persistence so a replay request right after the
            // build finds the file
            let _ = task.await;
        }
        Ok(())
    }
}

/// The distributor task for one session.
async fn distribute(
    digest: [u8; 32],
    mut line_rx: mpsc::UnboundedReceiver<Line>,
    mut subscribe_rx: mpsc::UnboundedReceiver<mpsc::Sender<Line>>,
    store: DirLogStore,
) {
    let mut buffer: Vec<Line> = Vec::new();
    let mut subscribers: Vec<mpsc::Sender<Line>> = Vec::new();

    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    buffer.push(line.clone());
                    // non-blocking fan-out; drop whoever is not keeping up
                    subscribers.retain(|sub| sub.try_send(line.clone()).is_ok());
                }
                None => break,
            },
            Some(sub) = subscribe_rx.recv() => {
                // catch the subscriber up before it goes live
                let mut keep = true;
                for line in &buffer {
                    if sub.try_send(line.clone()).is_err() {
                        keep = false;
                        break;
                    }
                }
                if keep {
                    subscribers.push(sub);
                }
            },
        }
    }

    // eject subscribers by dropping their senders
    subscribers.clear();

    debug!(digest = %hex::encode(digest), lines = buffer.len(), "persisting session log");
    if let Err(e) = store.save(&digest, &buffer).await {
        // log storage failures never fail the build
        warn!(digest = %hex::encode(digest), error = %e, "failed to persist log");
    }
}

/// A readable log: live subscription or disk replay.
pub enum LogStream {
    Live(mpsc::Receiver<Line>),
    Replay(std::vec::IntoIter<Line>),
}

impl LogStream {
    /// Next line; `None` is the end of the log.
    pub async fn next_line(&mut self) -> Option<Line> {
        match self {
            LogStream::Live(rx) => rx.recv().await,
            LogStream::Replay(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use fab_buildlog::Stream;
    use fab_recipe::Arch;

    fn info(digest: u8) -> BuildInfo {
        BuildInfo {
            name: "foo".to_string(),
            arch: Arch::parse("x86_64").unwrap(),
            bootstrap: false,
            hash: [digest; 32],
        }
    }

    async fn manager() -> (tempfile::TempDir, Arc<LogManager>) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let store = DirLogStore::new(dir);
        store.init().await.unwrap();
        (tmp, Arc::new(LogManager::new(store)))
    }

    async fn drain(mut stream: LogStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = stream.next_line().await {
            out.push(line.text);
        }
        out
    }

    #[tokio::test]
    async fn early_mid_and_late_subscribers_see_the_same_log() {
        let (_tmp, manager) = manager().await;
        let digest = [1u8; 32];
        let writer = manager.open(&info(1)).await.unwrap();

        // S1 subscribes before any line
        let s1 = manager.stream(&digest).await.unwrap();

        writer.log(Line::new(Stream::Stdout, "one")).await.unwrap();
        writer.log(Line::new(Stream::Stdout, "two")).await.unwrap();

        // S2 subscribes mid-build: replay then live
        let s2 = manager.stream(&digest).await.unwrap();
        assert!(matches!(s2, LogStream::Live(_)));

        writer.log(Line::new(Stream::Stdout, "three")).await.unwrap();
        writer.close().await.unwrap();

        // S3 arrives after close: served from disk
        let s3 = manager.stream(&digest).await.unwrap();
        assert!(matches!(s3, LogStream::Replay(_)));

        let expected = vec!["one", "two", "three"];
        assert_eq!(drain(s1).await, expected);
        assert_eq!(drain(s2).await, expected);
        assert_eq!(drain(s3).await, expected);
    }

    #[tokio::test]
    async fn unknown_digest_is_not_found() {
        let (_tmp, manager) = manager().await;
        assert!(matches!(
            manager.stream(&[9u8; 32]).await,
            Err(LogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocking() {
        let (_tmp, manager) = manager().await;
        let digest = [2u8; 32];
        let writer = manager.open(&info(2)).await.unwrap();

        // this subscriber never drains
        let stalled = manager.stream(&digest).await.unwrap();

        let total = SUBSCRIBER_CAPACITY + 100;
        for i in 0..total {
            writer
                .log(Line::new(Stream::Stdout, format!("line {i}")))
                .await
                .unwrap();
        }
        writer.close().await.unwrap();

        // the producer finished regardless; the stalled subscriber saw at
        // most its channel capacity before being dropped
        let seen = drain(stalled).await;
        assert!(seen.len() <= SUBSCRIBER_CAPACITY);

        // the persisted log is complete
        let replay = manager.stream(&digest).await.unwrap();
        assert_eq!(drain(replay).await.len(), total);
    }

    #[tokio::test]
    async fn replay_before_live_forwarding(){
        let (_tmp, manager) = manager().await;
        let digest = [3u8; 32];
        let writer = manager.open(&info(3)).await.unwrap();

        for i in 0..5 {
            writer
                .log(Line::new(Stream::Stdout, format!("buffered {i}")))
                .await
                .unwrap();
        }
        // give the distributor a chance to buffer
        tokio::task::yield_now().await;

        let sub = manager.stream(&digest).await.unwrap();
        writer.log(Line::new(Stream::Stdout, "live")).await.unwrap();
        writer.close().await.unwrap();

        let seen = drain(sub).await;
        assert_eq!(seen.first().map(String::as_str), Some("buffered 0"));
        assert_eq!(seen.last().map(String::as_str), Some("live"));
        assert_eq!(seen.len(), 6);
    }
}
