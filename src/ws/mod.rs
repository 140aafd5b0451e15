//! WebSocket change notification
//!
//! The sync engine pushes lightweight "something changed" signals here;
//! clients re-fetch over REST. A connection may subscribe to one instance,
//! and until it does it receives every broadcast, so a client that never
//! sends a subscribe message still gets told about changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;

/// What the sync engine needs from the notification side: whether anyone is
/// listening, and a way to fan out a change signal. Kept as a trait so the
/// engine can be tested against a recording fake.
pub trait UpdateSink: Send + Sync {
    fn client_count(&self) -> usize;
    fn broadcast_to_instance(&self, instance_id: i64, payload: Value);
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<Message>,
    /// None until the client sends a subscribe message; an unsubscribed
    /// client receives broadcasts for every instance.
    subscription: Option<i64>,
    /// Cleared by the heartbeat sweep, set again by any pong.
    alive: bool,
}

/// Registry of connected dashboard clients.
#[derive(Default)]
pub struct ChangeNotifier {
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and greets it.
    fn register(&self, tx: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        let greeting = json!({
            "type": "connected",
            "message": "connected to qbdeck sync updates",
        });
        let _ = tx.send(Message::Text(Utf8Bytes::from(greeting.to_string())));
        self.clients.write().insert(
            id,
            ClientHandle {
                tx,
                subscription: None,
                alive: true,
            },
        );
        debug!(client = %id, total = self.client_count(), "ws client connected");
        id
    }

    fn set_subscription(&self, id: Uuid, instance_id: i64) {
        if let Some(handle) = self.clients.write().get_mut(&id) {
            handle.subscription = Some(instance_id);
        }
    }

    fn mark_alive(&self, id: Uuid) {
        if let Some(handle) = self.clients.write().get_mut(&id) {
            handle.alive = true;
        }
    }

    fn remove(&self, id: Uuid) {
        self.clients.write().remove(&id);
        debug!(client = %id, total = self.client_count(), "ws client removed");
    }

    /// Periodic liveness sweep. A client that never answered the previous
    /// ping is dropped; everyone else gets pinged again.
    pub fn start_heartbeat(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut dead = Vec::new();
                {
                    let mut clients = self.clients.write();
                    for (id, handle) in clients.iter_mut() {
                        if !handle.alive {
                            dead.push(*id);
                            continue;
                        }
                        handle.alive = false;
                        let _ = handle.tx.send(Message::Ping(Vec::new().into()));
                    }
                    for id in &dead {
                        clients.remove(id);
                    }
                }
                for id in dead {
                    warn!(client = %id, "ws client timed out");
                }
            }
        });
    }
}

impl UpdateSink for ChangeNotifier {
    fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn broadcast_to_instance(&self, instance_id: i64, payload: Value) {
        let text = Utf8Bytes::from(payload.to_string());
        let clients = self.clients.read();
        for handle in clients.values() {
            let interested = match handle.subscription {
                None => true,
                Some(subscribed) => subscribed == instance_id,
            };
            if interested {
                let _ = handle.tx.send(Message::Text(text.clone()));
            }
        }
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.notifier.clone()))
}

async fn handle_socket(socket: WebSocket, notifier: Arc<ChangeNotifier>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = notifier.register(tx);

    // Single writer task so broadcasts and heartbeat pings never interleave
    // with reply frames mid-write.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&notifier, id, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => notifier.mark_alive(id),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut writer => break,
        }
    }

    notifier.remove(id);
}

fn handle_client_message(notifier: &ChangeNotifier, id: Uuid, text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        debug!(client = %id, "ignoring malformed ws message");
        return;
    };
    match message.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            if let Some(instance_id) = message.get("containerId").and_then(Value::as_i64) {
                debug!(client = %id, instance_id, "ws client subscribed");
                notifier.set_subscription(id, instance_id);
            }
        }
        Some("ping") => {
            // Application-level keepalive, distinct from protocol pings.
            if let Some(handle) = notifier.clients.read().get(&id) {
                let _ = handle.tx.send(Message::Text(Utf8Bytes::from(
                    json!({"type": "pong"}).to_string(),
                )));
            }
        }
        other => debug!(client = %id, kind = ?other, "ignoring unknown ws message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(notifier: &ChangeNotifier) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (notifier.register(tx), rx)
    }

    fn drain_texts(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        out
    }

    #[test]
    fn subscribed_client_only_sees_its_instance() {
        let notifier = ChangeNotifier::new();
        let (id, mut rx) = connect(&notifier);
        notifier.set_subscription(id, 5);
        drain_texts(&mut rx);

        notifier.broadcast_to_instance(5, json!({"type": "torrents_updated", "containerId": 5}));
        notifier.broadcast_to_instance(7, json!({"type": "torrents_updated", "containerId": 7}));

        let seen = drain_texts(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["containerId"], 5);
    }

    #[test]
    fn later_subscribe_replaces_the_earlier_one() {
        let notifier = ChangeNotifier::new();
        let (id, mut rx) = connect(&notifier);
        notifier.set_subscription(id, 5);
        notifier.set_subscription(id, 7);
        drain_texts(&mut rx);

        notifier.broadcast_to_instance(5, json!({"type": "torrents_updated", "containerId": 5}));
        notifier.broadcast_to_instance(7, json!({"type": "torrents_updated", "containerId": 7}));

        let seen = drain_texts(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["containerId"], 7);
    }

    #[test]
    fn unsubscribed_client_sees_every_instance() {
        let notifier = ChangeNotifier::new();
        let (_id, mut rx) = connect(&notifier);
        drain_texts(&mut rx);

        notifier.broadcast_to_instance(5, json!({"type": "torrents_updated", "containerId": 5}));
        notifier.broadcast_to_instance(7, json!({"type": "torrents_updated", "containerId": 7}));

        assert_eq!(drain_texts(&mut rx).len(), 2);
    }

    #[test]
    fn greeting_is_sent_on_register() {
        let notifier = ChangeNotifier::new();
        let (_id, mut rx) = connect(&notifier);
        let seen = drain_texts(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["type"], "connected");
    }

    #[test]
    fn client_count_tracks_register_and_remove() {
        let notifier = ChangeNotifier::new();
        assert_eq!(notifier.client_count(), 0);
        let (a, _rx_a) = connect(&notifier);
        let (_b, _rx_b) = connect(&notifier);
        assert_eq!(notifier.client_count(), 2);
        notifier.remove(a);
        assert_eq!(notifier.client_count(), 1);
    }
}
