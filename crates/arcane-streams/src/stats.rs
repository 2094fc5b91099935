//! Container stats producer: JSON-encodes snapshots into the hub.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::hub::{Frame, Hub};

/// Forwards JSON snapshots from `snapshots` into `hub`, one frame per
/// snapshot, until the source ends or `cancel` fires.
pub fn spawn_stats_pump(
    mut snapshots: mpsc::Receiver<serde_json::Value>,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                snapshot = snapshots.recv() => {
                    let Some(snapshot) = snapshot else { break };
                    if hub.broadcast(Frame::Text(snapshot.to_string())).is_err() {
                        trace!("stats frame dropped");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::hub::HubConfig;

    #[tokio::test]
    async fn snapshots_arrive_in_order_as_json_text() {
        let (hub, _task) = Hub::spawn(HubConfig::default(), || {});
        let mut client = hub.register().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let pump = spawn_stats_pump(rx, Arc::clone(&hub), CancellationToken::new());

        tx.send(json!({"cpu": 1})).await.unwrap();
        tx.send(json!({"cpu": 2})).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        for expected in [1, 2] {
            let frame = tokio::time::timeout(Duration::from_secs(1), client.frames.recv())
                .await
                .unwrap()
                .unwrap();
            let Frame::Text(text) = frame else {
                panic!("expected text frame")
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["cpu"], expected);
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let (hub, _task) = Hub::spawn(HubConfig::default(), || {});
        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = spawn_stats_pump(rx, hub, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump did not stop")
            .unwrap();
    }
}
