//! In-memory connector for tests.
//!
//! [`MockServer`] hands out a [`Connector`] whose links are pairs of
//! channels. Every successful open shows up on the server side as a
//! [`MockPeer`] that can read what the client wrote and push frames, closes
//! and errors back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{TransportError, TransportResult};
use crate::transport::{BoxFuture, Connector, FrameSink, Link, TransportEvent};

#[derive(Debug, Clone)]
struct Attempt {
    at: Instant,
    credential: Option<String>,
}

#[derive(Debug)]
struct MockState {
    refuse: AtomicBool,
    attempts: Mutex<Vec<Attempt>>,
    accept_tx: mpsc::UnboundedSender<MockPeer>,
}

/// Server side of the mock transport.
pub struct MockServer {
    state: Arc<MockState>,
    accept_rx: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockServer {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                refuse: AtomicBool::new(false),
                attempts: Mutex::new(Vec::new()),
                accept_tx,
            }),
            accept_rx,
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Make subsequent opens fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Wait for the next successfully opened link.
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.accept_rx.recv().await
    }

    /// Number of open attempts so far, refused ones included.
    pub fn attempt_count(&self) -> usize {
        self.attempts().len()
    }

    /// When each open attempt happened, in order.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts().into_iter().map(|a| a.at).collect()
    }

    /// Credential presented by the most recent open attempt.
    pub fn last_credential(&self) -> Option<String> {
        self.attempts().pop().and_then(|a| a.credential)
    }

    fn attempts(&self) -> Vec<Attempt> {
        self.state
            .attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

impl Connector for MockConnector {
    fn open(
        &self,
        _url: String,
        credential: Option<String>,
    ) -> BoxFuture<'static, TransportResult<Link>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            if let Ok(mut attempts) = state.attempts.lock() {
                attempts.push(Attempt {
                    at: Instant::now(),
                    credential,
                });
            }

            if state.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("connection refused".into()));
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let peer = MockPeer {
                frames: frame_rx,
                events: event_tx,
            };
            state
                .accept_tx
                .send(peer)
                .map_err(|_| TransportError::ConnectionFailed("mock server gone".into()))?;

            Ok(Link {
                sink: Box::new(MockSink {
                    frames: Some(frame_tx),
                }),
                events: event_rx,
            })
        })
    }
}

struct MockSink {
    frames: Option<mpsc::UnboundedSender<String>>,
}

impl FrameSink for MockSink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        let result = match &self.frames {
            Some(tx) => tx
                .send(text)
                .map_err(|_| TransportError::SendFailed("peer gone".into())),
            None => Err(TransportError::ConnectionClosed),
        };
        Box::pin(async move { result })
    }

    fn close(&mut self) -> BoxFuture<'_, TransportResult<()>> {
        self.frames = None;
        Box::pin(async { Ok(()) })
    }
}

/// Server end of one mock link. Dropping it is an unclean close.
#[derive(Debug)]
pub struct MockPeer {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    /// Next frame written by the client; `None` once the client closed or
    /// dropped the link.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    /// Deliver a text frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Frame(frame.into()));
    }

    /// Close the link with the given code (1000 is clean).
    pub fn close(&self, code: u16) {
        let _ = self.events.send(TransportEvent::closed(Some(code)));
    }

    /// Report a transport failure.
    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_string()));
    }
}
