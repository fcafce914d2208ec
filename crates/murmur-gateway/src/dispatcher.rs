use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock, broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use murmur_types::events::GatewayEvent;

/// A gateway event serialized once for every receiver.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    /// `Some` for conversation-scoped events; only subscribers receive those.
    pub conversation_id: Option<String>,
    pub json: Arc<str>,
}

/// Something queued for one user's connections.
#[derive(Debug, Clone, PartialEq)]
pub enum UserMessage {
    /// Forward to the client as is.
    Event(GatewayEvent),
    /// The user is no longer a participant; stop forwarding the
    /// conversation's broadcasts.
    Unsubscribe { conversation_id: String },
}

/// Manages all connected clients and broadcasts events.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel; each connection filters by its own subscriptions
    broadcast_tx: broadcast::Sender<BroadcastMessage>,

    /// Targeted send channels: user_id -> one entry per live connection
    user_channels: RwLock<HashMap<String, Vec<(Uuid, mpsc::UnboundedSender<UserMessage>)>>>,

    /// Held while a presence change is written, so writes for a fast
    /// reconnect land in connection order.
    presence_lock: Mutex<()>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
                presence_lock: Mutex::new(()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to every connected client. Conversation-scoped
    /// events are dropped by connections not subscribed to the conversation.
    pub fn broadcast(&self, event: GatewayEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize gateway event: {}", e);
                return;
            }
        };

        let _ = self.inner.broadcast_tx.send(BroadcastMessage {
            conversation_id: event.conversation_id().map(str::to_string),
            json: json.into(),
        });
    }

    /// Register a connection for `user_id`. Returns the connection id, its
    /// targeted receiver, and whether this is the user's first connection.
    pub async fn register_user_channel(
        &self,
        user_id: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<UserMessage>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.inner.user_channels.write().await;
        let entries = channels.entry(user_id.to_string()).or_default();
        let first = entries.is_empty();
        entries.push((conn_id, tx));
        (conn_id, rx, first)
    }

    /// Unregister one connection. Returns true if it was the user's last.
    pub async fn unregister_user_channel(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut channels = self.inner.user_channels.write().await;
        let Some(entries) = channels.get_mut(user_id) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|(id, _)| *id != conn_id);
        if entries.len() == before {
            return false;
        }

        if entries.is_empty() {
            channels.remove(user_id);
            return true;
        }
        false
    }

    /// Send a targeted event to every connection of one user.
    pub async fn send_to_user(&self, user_id: &str, event: GatewayEvent) {
        self.queue_for_user(user_id, UserMessage::Event(event)).await;
    }

    /// Send a targeted event to several users, e.g. every member of a
    /// conversation whose membership just changed.
    pub async fn send_to_users(&self, user_ids: &[String], event: GatewayEvent) {
        for user_id in user_ids {
            self.send_to_user(user_id, event.clone()).await;
        }
    }

    /// Drop `conversation_id` from every live subscription of `user_ids`.
    /// Call before broadcasting anything else for the conversation.
    pub async fn revoke_subscription(&self, user_ids: &[String], conversation_id: &str) {
        for user_id in user_ids {
            let message = UserMessage::Unsubscribe {
                conversation_id: conversation_id.to_string(),
            };
            self.queue_for_user(user_id, message).await;
        }
    }

    /// Whether `user_id` has at least one live connection.
    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.inner.user_channels.read().await.contains_key(user_id)
    }

    /// Serialize presence writes. Hold the guard across the connection
    /// check and the store.
    pub async fn lock_presence(&self) -> MutexGuard<'_, ()> {
        self.inner.presence_lock.lock().await
    }

    async fn queue_for_user(&self, user_id: &str, message: UserMessage) {
        let channels = self.inner.user_channels.read().await;
        if let Some(entries) = channels.get(user_id) {
            for (_, tx) in entries {
                let _ = tx.send(message.clone());
            }
        }
    }
}
