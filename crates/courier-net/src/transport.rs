//! Transport abstraction for the duplex link.
//!
//! A [`Connector`] opens a [`Link`]: a write half ([`FrameSink`]) plus a
//! channel of [`TransportEvent`]s produced by a reader task. The connection
//! actor only ever sees these typed events, never raw socket callbacks.

use std::future::Future;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::{TransportError, TransportResult};

/// Close code of a clean, requested shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame from the server.
    Frame(String),
    /// The link closed. `clean` is true only for a normal (1000) close.
    Closed { code: Option<u16>, clean: bool },
    /// The link failed.
    Error(String),
}

impl TransportEvent {
    pub fn closed(code: Option<u16>) -> Self {
        Self::Closed {
            code,
            clean: code == Some(NORMAL_CLOSURE),
        }
    }
}

/// Write half of an open link.
pub trait FrameSink: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>>;

    /// Perform a clean close (code 1000).
    fn close(&mut self) -> BoxFuture<'_, TransportResult<()>>;
}

/// An open link. Dropping `events` without a `Closed` event means the reader
/// went away, which is treated as an unclean close.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links. Implemented by [`WebSocketConnector`] and, for tests, by the
/// in-memory mock connector.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        url: String,
        credential: Option<String>,
    ) -> BoxFuture<'static, TransportResult<Link>>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector built on tokio-tungstenite. The optional credential is
/// sent as a bearer `Authorization` header on the upgrade request.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        url: String,
        credential: Option<String>,
    ) -> BoxFuture<'static, TransportResult<Link>> {
        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

            if let Some(token) = credential {
                request.headers_mut().insert(
                    "Authorization",
                    format!("Bearer {token}").parse().map_err(|_| {
                        TransportError::InvalidRequest("credential is not a valid header value".into())
                    })?,
                );
            }

            let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            debug!(url = %url, "websocket open");

            let (sink, stream) = ws_stream.split();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let reader = tokio::spawn(read_loop(stream, event_tx));

            Ok(Link {
                sink: Box::new(WsSink { sink, reader }),
                events: event_rx,
            })
        })
    }
}

struct WsSink {
    sink: futures::stream::SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

impl FrameSink for WsSink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            self.sink
                .send(Message::Close(Some(frame)))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Forward socket messages as [`TransportEvent`]s until the link ends.
async fn read_loop(
    mut stream: futures::stream::SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(Message::Text(text)) => TransportEvent::Frame(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => TransportEvent::Frame(text),
                Err(_) => {
                    debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let code = frame.map(|f| u16::from(f.code));
                let _ = events.send(TransportEvent::closed(code));
                return;
            }
            Ok(_) => {
                trace!("ignoring control frame");
                continue;
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(TransportEvent::closed(None));
}
