//! Connection manager.
//!
//! The manager runs as a single tokio task that owns the link, the lifecycle
//! state, the reconnect timer, the heartbeat timer and the dispatch queue.
//! Callers talk to it through a cloneable [`ConnectionHandle`]; everything the
//! link produces comes back as [`ConnectionNotification`]s. Every input
//! (command, open result, transport event, timer) is folded into the state
//! machine one at a time, so there are no races between callbacks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use courier_shared::constants::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_LIVENESS_MISSED_HEARTBEATS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_SECS,
};
use courier_shared::protocol::OutboundFrame;
use courier_shared::types::ConnectionStatus;

use crate::backoff::Backoff;
use crate::error::{NetError, TransportResult};
use crate::queue::DispatchQueue;
use crate::transport::{Connector, FrameSink, Link, TransportEvent};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing knobs of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Interval between `ping` frames. Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without any inbound frame before the link is
    /// force-closed. Zero disables the liveness check.
    pub liveness_missed: u32,
    /// Delay before the first reconnect attempt.
    pub reconnect_base: Duration,
    /// Upper bound of the reconnect delay.
    pub reconnect_max: Duration,
    /// Scheduled retries allowed before giving up with `error`.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            liveness_missed: DEFAULT_LIVENESS_MISSED_HEARTBEATS,
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    fn liveness_timeout(&self) -> Option<Duration> {
        if self.liveness_missed == 0 || self.heartbeat_interval.is_zero() {
            None
        } else {
            Some(self.heartbeat_interval * self.liveness_missed)
        }
    }
}

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
enum ConnectionCommand {
    Connect {
        url: String,
        credential: Option<String>,
    },
    Disconnect,
    /// An encoded outbound frame.
    Send(String),
    Snapshot(oneshot::Sender<ConnectionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Notifications sent *from* the connection task to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    /// The lifecycle state changed. `Connected` is emitted after the dispatch
    /// queue has been flushed.
    StatusChanged(ConnectionStatus),
    /// One inbound text frame, in arrival order.
    FrameReceived(String),
    /// The reconnect budget is spent; only an explicit `connect` recovers.
    RetriesExhausted { attempts: u32 },
}

/// Point-in-time view of the manager, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub queued_frames: usize,
    pub reconnect_scheduled: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    /// Open the link to `url`. Ignored while connected or connecting.
    pub fn connect(&self, url: impl Into<String>, credential: Option<String>) -> Result<(), NetError> {
        self.command(ConnectionCommand::Connect {
            url: url.into(),
            credential,
        })
    }

    /// Close the link cleanly and stop all reconnect and heartbeat timers.
    /// Queued frames are kept for the next connection.
    pub fn disconnect(&self) -> Result<(), NetError> {
        self.command(ConnectionCommand::Disconnect)
    }

    /// Transmit a frame now if connected, otherwise queue it.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), NetError> {
        let text = frame.encode()?;
        self.command(ConnectionCommand::Send(text))
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(ConnectionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| NetError::ActorGone)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Disconnect and stop the task, waiting until it has exited.
    pub async fn shutdown(&self) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(ConnectionCommand::Shutdown(tx))?;
        rx.await.map_err(|_| NetError::ActorGone)
    }

    /// Ask the task to disconnect and exit without waiting for it.
    pub fn close(&self) -> Result<(), NetError> {
        let (tx, _rx) = oneshot::channel();
        self.command(ConnectionCommand::Shutdown(tx))
    }

    fn command(&self, cmd: ConnectionCommand) -> Result<(), NetError> {
        self.cmd_tx.send(cmd).map_err(|_| NetError::ActorGone)
    }
}

/// Spawn the connection manager in a background tokio task.
///
/// Returns the handle and the notification stream. The task starts
/// `disconnected` and does nothing until [`ConnectionHandle::connect`].
pub fn spawn_connection(
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
) -> (
    ConnectionHandle,
    mpsc::UnboundedReceiver<ConnectionNotification>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
    let (open_tx, open_rx) = mpsc::unbounded_channel();

    let actor = ConnectionActor {
        connector,
        backoff: Backoff::new(config.reconnect_base, config.reconnect_max),
        config,
        status: ConnectionStatus::Disconnected,
        status_tx,
        notif_tx,
        open_tx,
        target: None,
        attempts: 0,
        epoch: 0,
        opening: None,
        sink: None,
        events: None,
        reconnect_at: None,
        next_heartbeat: None,
        last_seen: None,
        last_heartbeat_at: None,
        queue: DispatchQueue::new(),
    };

    tokio::spawn(actor.run(cmd_rx, open_rx));

    (ConnectionHandle { cmd_tx, status_rx }, notif_rx)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Target {
    url: String,
    credential: Option<String>,
}

type OpenResult = (u64, TransportResult<Link>);

struct ConnectionActor {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    backoff: Backoff,

    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    notif_tx: mpsc::UnboundedSender<ConnectionNotification>,
    open_tx: mpsc::UnboundedSender<OpenResult>,

    target: Option<Target>,
    attempts: u32,
    /// Bumped for every open and every disconnect; open results carrying an
    /// older epoch are discarded.
    epoch: u64,
    opening: Option<JoinHandle<()>>,

    sink: Option<Box<dyn FrameSink>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    reconnect_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    last_seen: Option<Instant>,
    last_heartbeat_at: Option<DateTime<Utc>>,

    queue: DispatchQueue,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        mut open_rx: mpsc::UnboundedReceiver<OpenResult>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnectionCommand::Shutdown(done)) => {
                        self.disconnect().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                Some((epoch, result)) = open_rx.recv() => {
                    self.on_open_result(epoch, result).await;
                }
                event = next_event(&mut self.events) => {
                    self.on_transport_event(event).await;
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_open();
                }
                _ = sleep_until(self.next_heartbeat) => {
                    self.on_heartbeat().await;
                }
            }
        }

        debug!("connection task stopped");
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Connect { url, credential } => {
                if matches!(
                    self.status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                ) {
                    debug!(status = self.status.as_str(), "connect ignored");
                    return;
                }
                self.reconnect_at = None;
                self.target = Some(Target { url, credential });
                self.start_open();
            }
            ConnectionCommand::Disconnect => self.disconnect().await,
            ConnectionCommand::Send(frame) => self.dispatch(frame).await,
            ConnectionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled in `run`.
            ConnectionCommand::Shutdown(_) => {}
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            reconnect_attempts: self.attempts,
            queued_frames: self.queue.len(),
            reconnect_scheduled: self.reconnect_at.is_some(),
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }

    // -- lifecycle ---------------------------------------------------------

    fn start_open(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.set_status(ConnectionStatus::Connecting);
        info!(url = %target.url, attempt = self.attempts, "opening connection");

        let open = self.connector.open(target.url, target.credential);
        let open_tx = self.open_tx.clone();
        self.opening = Some(tokio::spawn(async move {
            let result = open.await;
            let _ = open_tx.send((epoch, result));
        }));
    }

    async fn on_open_result(&mut self, epoch: u64, result: TransportResult<Link>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "discarding stale open result");
            if let Ok(mut link) = result {
                let _ = link.sink.close().await;
            }
            return;
        }
        self.opening = None;

        match result {
            Ok(link) => {
                self.sink = Some(link.sink);
                self.events = Some(link.events);
                self.attempts = 0;
                self.last_seen = Some(Instant::now());
                info!("connected");

                self.flush_queue().await;
                if self.sink.is_none() {
                    // The flush already failed and scheduled a reconnect.
                    return;
                }
                if !self.config.heartbeat_interval.is_zero() {
                    self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
                }
                self.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
                self.set_status(ConnectionStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => {
                self.last_seen = Some(Instant::now());
                trace!(len = text.len(), "frame received");
                self.notify(ConnectionNotification::FrameReceived(text));
            }
            TransportEvent::Closed { code, clean } => {
                self.drop_link();
                self.set_status(ConnectionStatus::Disconnected);
                if clean {
                    info!(?code, "connection closed cleanly");
                } else {
                    warn!(?code, "connection closed unexpectedly");
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Error(reason) => self.on_link_failure(&reason),
        }
    }

    fn on_link_failure(&mut self, reason: &str) {
        warn!(reason, "connection failed");
        self.drop_link();
        self.set_status(ConnectionStatus::Error);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.target.is_none() {
            return;
        }

        if self.attempts >= self.config.max_reconnect_attempts {
            warn!(attempts = self.attempts, "reconnect attempts exhausted");
            self.reconnect_at = None;
            self.set_status(ConnectionStatus::Error);
            self.notify(ConnectionNotification::RetriesExhausted {
                attempts: self.attempts,
            });
            return;
        }

        self.attempts += 1;
        let delay = self.backoff.delay(self.attempts);
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.attempts = 0;
        self.target = None;
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }

        let sink = self.sink.take();
        self.drop_link();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "close handshake failed");
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Forget the current link and its heartbeat.
    fn drop_link(&mut self) {
        self.sink = None;
        self.events = None;
        self.next_heartbeat = None;
        self.last_seen = None;
    }

    // -- outbound ----------------------------------------------------------

    async fn dispatch(&mut self, frame: String) {
        let ready = self.status == ConnectionStatus::Connected && self.queue.is_empty();
        let Some(sink) = self.sink.as_mut().filter(|_| ready) else {
            trace!(queued = self.queue.len() + 1, "link not ready, queueing frame");
            self.queue.push(frame);
            return;
        };

        if let Err(e) = sink.send_text(frame.clone()).await {
            self.queue.push(frame);
            self.on_link_failure(&e.to_string());
        }
    }

    /// Write every queued frame in insertion order. On a write failure the
    /// unsent remainder goes back to the head of the queue.
    async fn flush_queue(&mut self) {
        let mut frames = self.queue.take_all();
        if frames.is_empty() {
            return;
        }
        debug!(frames = frames.len(), "flushing dispatch queue");

        while let Some(frame) = frames.pop_front() {
            let Some(sink) = self.sink.as_mut() else {
                frames.push_front(frame);
                self.queue.restore_front(frames);
                return;
            };
            if let Err(e) = sink.send_text(frame.clone()).await {
                frames.push_front(frame);
                self.queue.restore_front(frames);
                self.on_link_failure(&e.to_string());
                return;
            }
        }
    }

    // -- heartbeat ---------------------------------------------------------

    async fn on_heartbeat(&mut self) {
        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval);

        if let (Some(timeout), Some(last_seen)) = (self.config.liveness_timeout(), self.last_seen) {
            let silent = last_seen.elapsed();
            if silent >= timeout {
                warn!(
                    silent_ms = silent.as_millis() as u64,
                    "no inbound traffic, closing link"
                );
                let sink = self.sink.take();
                self.drop_link();
                if let Some(mut sink) = sink {
                    let _ = sink.close().await;
                }
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
                return;
            }
        }

        let ping = match OutboundFrame::ping_now().encode() {
            Ok(ping) => ping,
            Err(e) => {
                warn!(error = %e, "failed to encode ping");
                return;
            }
        };

        let Some(sink) = self.sink.as_mut() else {
            self.next_heartbeat = None;
            return;
        };
        match sink.send_text(ping).await {
            Ok(()) => {
                self.last_heartbeat_at = Some(Utc::now());
                trace!("heartbeat sent");
            }
            Err(e) => self.on_link_failure(&e.to_string()),
        }
    }

    // -- helpers -----------------------------------------------------------

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        info!(from = self.status.as_str(), to = status.as_str(), "connection status");
        self.status = status;
        self.status_tx.send_replace(status);
        self.notify(ConnectionNotification::StatusChanged(status));
    }

    fn notify(&self, notification: ConnectionNotification) {
        let _ = self.notif_tx.send(notification);
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> TransportEvent {
    match events.as_mut() {
        // A vanished reader is an unclean close.
        Some(rx) => rx.recv().await.unwrap_or(TransportEvent::closed(None)),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
