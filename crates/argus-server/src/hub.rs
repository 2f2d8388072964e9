use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use argus_core::ids::ClientId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// A connected live-stream subscriber.
pub struct Subscriber {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Subscriber {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live subscribers. Sends are best-effort per subscriber:
/// a full queue or closed connection drops that subscriber's message and
/// never blocks delivery to others or the ingestion path.
pub struct SubscriberRegistry {
    subscribers: DashMap<ClientId, Arc<Subscriber>>,
    max_send_queue: usize,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new subscriber and return its ID + message receiver.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscriber = Arc::new(Subscriber::new(id.clone(), tx));
        self.subscribers.insert(id.clone(), subscriber);
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, subscriber)) = self.subscribers.remove(id) {
            subscriber.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Send a message to one subscriber. Returns false when it could not
    /// be delivered (unknown, closed, or backed up).
    pub fn send_to(&self, id: &ClientId, message: String) -> bool {
        let Some(subscriber) = self.subscribers.get(id) else {
            return false;
        };
        match subscriber.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %id,
                    msg_len = msg.len(),
                    "subscriber queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Push a message to every connected subscriber. Failing subscribers
    /// are skipped and logged.
    pub fn broadcast_all(&self, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.is_connected() {
                continue;
            }
            match subscriber.tx.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(client_id = %subscriber.id, error = %e, "broadcast send skipped");
                }
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn record_pong(&self, id: &ClientId) {
        if let Some(subscriber) = self.subscribers.get(id) {
            subscriber.record_pong();
        }
    }

    /// Remove subscribers that haven't answered pings within the timeout.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<ClientId> = self
            .subscribers
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.value().id.clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(client_id = %id, "cleaned up dead subscriber");
        }
        removed
    }
}

/// Handle one WebSocket connection: writer forwards queued messages plus
/// heartbeat pings, reader feeds inbound text to the message processor
/// and tracks pongs.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SubscriberRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(subscriber) = writer_registry.subscribers.get(&writer_cid) {
            subscriber.connected.store(false, Ordering::Relaxed);
        }
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    reader_registry.record_pong(&reader_cid);
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pongs automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
}

/// Periodic dead-subscriber cleanup.
pub fn start_cleanup_task(
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead();
            if removed > 0 {
                tracing::info!(removed, "dead subscriber cleanup");
            }
        }
    })
}
