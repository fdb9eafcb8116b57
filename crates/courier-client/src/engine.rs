//! The sync engine: owns the ledger, the connection manager and the bridge
//! task that feeds connection notifications into the reconciler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use courier_net::{
    spawn_connection, ConnectionHandle, ConnectionNotification, ConnectionSnapshot, Connector,
};
use courier_shared::constants::DEFAULT_PAGE_SIZE;
use courier_shared::protocol::{ChatPayload, OutboundFrame};
use courier_shared::types::{
    ClientId, ConnectionStatus, ConversationId, GroupId, MessageType, UserId,
};
use courier_store::{Conversation, Database, LedgerStats, Message};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, event_channel, SyncEvent};
use crate::reconciler::Reconciler;
use crate::sync::prepare_sync;
use crate::{lock_ledger, SharedLedger};

/// Who an outgoing message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Direct(UserId),
    Group(GroupId),
}

impl Recipient {
    pub fn conversation_for(&self, local_user: UserId) -> ConversationId {
        match *self {
            Self::Direct(user) => ConversationId::direct(local_user, user),
            Self::Group(group) => ConversationId::group(group),
        }
    }
}

pub struct SyncEngine {
    db: SharedLedger,
    connection: ConnectionHandle,
    events: broadcast::Sender<SyncEvent>,
    local_user: UserId,
    server_url: String,
    token: Option<String>,
    bridge: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Start the connection manager and the bridge task, then queue every
    /// message still `pending` from a previous run. The engine starts
    /// disconnected.
    pub fn start(db: Database, connector: Arc<dyn Connector>, config: &ClientConfig) -> Result<Self> {
        let db: SharedLedger = Arc::new(Mutex::new(db));
        let events = event_channel();
        let (connection, notifications) = spawn_connection(connector, config.connection_config());

        let pending = lock_ledger(&db)?.get_pending_messages()?;
        for message in &pending {
            connection.send(&chat_frame(message))?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "re-queued pending messages");
        }

        let bridge = Bridge {
            db: db.clone(),
            connection: connection.clone(),
            reconciler: Reconciler::new(db.clone(), config.user_id, events.clone()),
            events: events.clone(),
            sync_interval: config.sync_interval(),
            ticker: None,
        };
        let bridge = tokio::spawn(bridge.run(notifications));

        info!(user = %config.user_id, "sync engine started");

        Ok(Self {
            db,
            connection,
            events,
            local_user: config.user_id,
            server_url: config.server_url.clone(),
            token: config.token.clone(),
            bridge: Some(bridge),
        })
    }

    /// Connect to the configured server.
    pub fn connect(&self) -> Result<()> {
        self.connect_to(self.server_url.clone(), self.token.clone())
    }

    pub fn connect_to(&self, url: impl Into<String>, credential: Option<String>) -> Result<()> {
        self.connection.connect(url, credential)?;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.connection.disconnect()?;
        Ok(())
    }

    /// Write a `pending` message to the ledger and hand its `chat` frame to
    /// the dispatch queue. Returns as soon as the ledger write is done; the
    /// status moves on when the server acks.
    pub fn send_message(
        &self,
        recipient: Recipient,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<ClientId> {
        let (recipient_id, group_id) = match recipient {
            Recipient::Direct(user) => (Some(user), None),
            Recipient::Group(group) => (None, Some(group)),
        };
        let message = Message::outgoing(
            recipient.conversation_for(self.local_user),
            self.local_user,
            recipient_id,
            group_id,
            content.into(),
            message_type,
        );

        {
            let mut db = lock_ledger(&self.db)?;
            db.record_outgoing(&message)?;
            // Enqueued under the ledger lock so queue order matches insert order.
            self.connection.send(&chat_frame(&message))?;
        }

        debug!(client_id = %message.client_id, conversation = %message.conversation_id, "message queued");
        emit_event(
            &self.events,
            SyncEvent::MessageQueued {
                client_id: message.client_id.clone(),
                conversation_id: message.conversation_id,
            },
        );
        Ok(message.client_id)
    }

    /// Mark everything received in the conversation as read.
    pub fn mark_conversation_read(&self, id: &ConversationId) -> Result<usize> {
        let changed = lock_ledger(&self.db)?.mark_conversation_read(id, self.local_user)?;
        emit_event(
            &self.events,
            SyncEvent::UnreadChanged {
                conversation_id: id.clone(),
                unread_count: 0,
            },
        );
        Ok(changed)
    }

    pub fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(lock_ledger(&self.db)?.list_conversations()?)
    }

    /// One page of history, newest first. Page 0 is the most recent.
    pub fn conversation_messages(&self, id: &ConversationId, page: u32) -> Result<Vec<Message>> {
        let offset = page.saturating_mul(DEFAULT_PAGE_SIZE);
        Ok(lock_ledger(&self.db)?.get_conversation_messages(id, DEFAULT_PAGE_SIZE, offset)?)
    }

    pub fn message(&self, client_id: &ClientId) -> Result<Option<Message>> {
        Ok(lock_ledger(&self.db)?.find_message(client_id)?)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        Ok(lock_ledger(&self.db)?.stats()?)
    }

    pub fn clear_conversation(&self, id: &ConversationId) -> Result<usize> {
        Ok(lock_ledger(&self.db)?.clear_conversation(id)?)
    }

    /// Wipe the local ledger, e.g. on sign-out. Frames already queued are
    /// not recalled.
    pub fn clear_all_data(&self) -> Result<()> {
        lock_ledger(&self.db)?.clear_all_data()?;
        info!("local ledger wiped");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub async fn connection_snapshot(&self) -> Result<ConnectionSnapshot> {
        Ok(self.connection.snapshot().await?)
    }

    /// Send a `sync` frame now, or queue it until connected.
    pub fn request_sync(&self) -> Result<()> {
        send_sync(&self.db, &self.connection)
    }

    /// Stop the connection and the bridge, then close the ledger.
    pub async fn shutdown(mut self) -> Result<()> {
        self.connection.shutdown().await?;
        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.await {
                warn!(error = %e, "bridge task ended abnormally");
            }
        }

        let db = Arc::clone(&self.db);
        drop(self);
        match Arc::try_unwrap(db) {
            Ok(db) => {
                let db = db.into_inner().map_err(|_| ClientError::LockPoisoned)?;
                db.close()?;
            }
            Err(_) => debug!("ledger still shared, leaving it open"),
        }

        info!("sync engine stopped");
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
            if self.connection.close().is_ok() {
                debug!("sync engine dropped without shutdown, connection closed");
            }
        }
    }
}

/// `chat` frame for a ledger message.
fn chat_frame(message: &Message) -> OutboundFrame {
    OutboundFrame::Chat(ChatPayload {
        client_id: message.client_id.clone(),
        conversation_id: message.conversation_id.clone(),
        recipient_id: message.recipient_id,
        group_id: message.group_id,
        content: message.content.clone(),
        message_type: message.message_type,
    })
}

fn send_sync(db: &SharedLedger, connection: &ConnectionHandle) -> Result<()> {
    // The ledger lock is released before the frame is handed off.
    let frame = prepare_sync(&*lock_ledger(db)?)?;
    connection.send(&frame)?;
    Ok(())
}

/// Task state that routes connection notifications.
struct Bridge {
    db: SharedLedger,
    connection: ConnectionHandle,
    reconciler: Reconciler,
    events: broadcast::Sender<SyncEvent>,
    sync_interval: Option<Duration>,
    ticker: Option<Interval>,
}

impl Bridge {
    async fn run(mut self, mut notifications: mpsc::UnboundedReceiver<ConnectionNotification>) {
        debug!("notification bridge started");

        loop {
            tokio::select! {
                note = notifications.recv() => match note {
                    Some(note) => self.on_notification(note),
                    None => break,
                },
                _ = next_tick(&mut self.ticker) => {
                    debug!("periodic sync");
                    self.sync();
                }
            }
        }

        debug!("notification bridge stopped");
    }

    fn on_notification(&mut self, note: ConnectionNotification) {
        match note {
            ConnectionNotification::StatusChanged(status) => {
                emit_event(&self.events, SyncEvent::ConnectionChanged { status });
                if status == ConnectionStatus::Connected {
                    self.sync();
                    self.ticker = self.sync_interval.map(|period| {
                        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        ticker
                    });
                } else {
                    self.ticker = None;
                }
            }
            ConnectionNotification::FrameReceived(text) => {
                self.reconciler.apply_text(&text);
            }
            ConnectionNotification::RetriesExhausted { attempts } => {
                emit_event(&self.events, SyncEvent::RetriesExhausted { attempts });
            }
        }
    }

    fn sync(&self) {
        if let Err(e) = send_sync(&self.db, &self.connection) {
            error!(error = %e, "failed to request sync");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
