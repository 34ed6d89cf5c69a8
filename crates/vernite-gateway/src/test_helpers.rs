//! Shared fixtures for unit tests.

use crate::session::{ConnectionSession, Frame, FrameSink};
use crate::store::User;
use futures_util::future::{self, BoxFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vernite_proto::{codec, Packet, VerniteError, VerniteResult};

/// Sink that records every frame, or fails every write.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    attempts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn shared(&self) -> Arc<dyn FrameSink> {
        Arc::new(self.clone())
    }

    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(t) => Some(t),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// Decode every binary frame carrying a `P`.
    pub(crate) fn packets<P: Packet>(&self) -> Vec<P> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => codec::decode(&b).ok(),
                Frame::Text(_) => None,
            })
            .filter(|e| e.is::<P>())
            .map(|e| e.unpack::<P>().unwrap())
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VerniteError::Transport("broken pipe".into()));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Sink whose writes never complete, like a peer that stopped reading.
pub(crate) struct StalledSink;

impl FrameSink for StalledSink {
    fn send_frame(&self, _frame: Frame) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(future::pending())
    }

    fn close(&self) -> BoxFuture<'_, VerniteResult<()>> {
        Box::pin(future::pending())
    }
}

/// Let spawned writer tasks drain their queues.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn alice() -> User {
    User {
        id: 1,
        username: "alice".into(),
        deleted: false,
    }
}

pub(crate) fn bob() -> User {
    User {
        id: 2,
        username: "bob".into(),
        deleted: false,
    }
}

/// A session over a fresh recording sink.
pub(crate) fn session_with(user: Option<User>) -> (Arc<ConnectionSession>, RecordingSink) {
    let sink = RecordingSink::new();
    let session = Arc::new(ConnectionSession::new(
        "127.0.0.1:40000".into(),
        user,
        sink.shared(),
    ));
    (session, sink)
}
