use std::sync::Arc;

use tokio::sync::broadcast;

use argus_engine::Update;

use crate::hub::SubscriberRegistry;

/// Forwards engine updates from the pipeline's broadcast channel to all
/// connected WebSocket subscribers. Delivery is fire-and-forget relative
/// to ingestion: a lagged or closed receiver only affects this bridge.
pub fn create_bridge(
    registry: Arc<SubscriberRegistry>,
    mut rx: broadcast::Receiver<Update>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if let Ok(json) = serde_json::to_string(&update) {
                        registry.broadcast_all(&json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "stream bridge lagged, dropped updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("stream bridge channel closed");
                    break;
                }
            }
        }
    })
}
