use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, info, warn};

use murmur_db::Database;
use murmur_db::models::UserRow;
use murmur_types::api::Claims;
use murmur_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::{Dispatcher, UserMessage};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket has to send `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Subscriptions = Arc<RwLock<HashSet<String>>>;

/// Handle a single WebSocket connection: Identify handshake, Ready, then the
/// event loop until either side goes away.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let Some(subject) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    let lookup_db = db.clone();
    let user = match tokio::task::spawn_blocking(move || {
        lookup_db.resolve_current_user(Some(&subject))
    })
    .await
    {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            warn!("WebSocket identity rejected: {}", e);
            return;
        }
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            return;
        }
    };

    info!("{} ({}) connected to gateway", user.name, user.id);

    let ready = GatewayEvent::Ready {
        user_id: user.id.clone(),
        name: user.name.clone(),
    };
    if !send_event(&mut sender, &ready).await {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, db, user).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user: UserRow,
) {
    // Subscribe before announcing presence so nothing is missed in between.
    let mut broadcast_rx = dispatcher.subscribe();
    let (conn_id, mut user_rx, first) = dispatcher.register_user_channel(&user.id).await;
    if first {
        update_presence(&dispatcher, &db, &user).await;
    }

    // Per-connection conversation subscriptions (shared between send and recv tasks).
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            // Targeted messages first, so a revoke queued before a broadcast
            // is applied before that broadcast is forwarded.
            tokio::select! {
                biased;

                result = user_rx.recv() => {
                    match result {
                        Some(UserMessage::Event(event)) => {
                            if !send_event(&mut sender, &event).await {
                                break;
                            }
                        }
                        Some(UserMessage::Unsubscribe { conversation_id }) => {
                            unsubscribe(&send_subscriptions, &conversation_id);
                        }
                        None => break,
                    }
                }
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(conversation_id) = &msg.conversation_id {
                        if !is_subscribed(&send_subscriptions, conversation_id) {
                            continue;
                        }
                    }

                    if sender.send(Message::Text(msg.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_dispatcher = dispatcher.clone();
    let recv_db = db.clone();
    let recv_user = user.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&recv_dispatcher, &recv_db, &recv_user, cmd, &subscriptions)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_user.name,
                            recv_user.id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if dispatcher.unregister_user_channel(&user.id, conn_id).await {
        update_presence(&dispatcher, &db, &user).await;
    }
    info!("{} ({}) disconnected from gateway", user.name, user.id);
}

/// Wait for an `Identify` command and return the verified token subject.
async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<String> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims.sub);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user: &UserRow,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { conversation_ids } => {
            let db = db.clone();
            let user_id = user.id.clone();
            let allowed = tokio::task::spawn_blocking(move || {
                conversation_ids
                    .into_iter()
                    .filter(|id| db.is_participant(id, &user_id).unwrap_or(false))
                    .collect::<HashSet<String>>()
            })
            .await
            .unwrap_or_default();

            info!(
                "{} ({}) subscribing to {} conversations",
                user.name,
                user.id,
                allowed.len()
            );
            if let Ok(mut subs) = subscriptions.write() {
                *subs = allowed;
            }
        }

        GatewayCommand::StartTyping { conversation_id } => {
            if set_typing(db, user, &conversation_id, true).await {
                dispatcher.broadcast(GatewayEvent::TypingStart {
                    conversation_id,
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                });
            }
        }

        GatewayCommand::StopTyping { conversation_id } => {
            if set_typing(db, user, &conversation_id, false).await {
                dispatcher.broadcast(GatewayEvent::TypingStop {
                    conversation_id,
                    user_id: user.id.clone(),
                });
            }
        }
    }
}

/// Record a typing signal. Failures are logged and swallowed: typing is
/// best effort.
async fn set_typing(db: &Arc<Database>, user: &UserRow, conversation_id: &str, is_typing: bool) -> bool {
    let db = db.clone();
    let user_id = user.id.clone();
    let conversation_id = conversation_id.to_string();

    match tokio::task::spawn_blocking(move || db.set_typing(&user_id, &conversation_id, is_typing)).await {
        Ok(Ok(applied)) => applied,
        Ok(Err(e)) => {
            debug!("Typing signal from {} dropped: {}", user.id, e);
            false
        }
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            false
        }
    }
}

/// Persist presence and announce it to every client. The stored state is
/// read from the live connection set under the presence lock, so a
/// disconnect racing a reconnect cannot leave a connected user offline.
async fn update_presence(dispatcher: &Dispatcher, db: &Arc<Database>, user: &UserRow) {
    let _guard = dispatcher.lock_presence().await;
    let online = dispatcher.is_connected(&user.id).await;

    let presence_db = db.clone();
    let user_id = user.id.clone();
    match tokio::task::spawn_blocking(move || presence_db.set_presence(&user_id, online)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Failed to store presence for {}: {}", user.id, e),
        Err(e) => warn!("spawn_blocking join error: {}", e),
    }

    dispatcher.broadcast(GatewayEvent::PresenceUpdate {
        user_id: user.id.clone(),
        name: user.name.clone(),
        online,
    });
}

fn unsubscribe(subscriptions: &Subscriptions, conversation_id: &str) {
    if let Ok(mut subs) = subscriptions.write() {
        subs.remove(conversation_id);
    }
}

fn is_subscribed(subscriptions: &Subscriptions, conversation_id: &str) -> bool {
    subscriptions
        .read()
        .map(|subs| subs.contains(conversation_id))
        .unwrap_or(false)
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            true
        }
    }
}
