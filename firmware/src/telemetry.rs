//! Telemetry publisher: 1 Hz fan-out of the controller snapshot.
//!
//! Observers subscribe through a broadcast channel; the publisher never
//! waits on a subscriber. Lagging receivers lose old frames and closed
//! receivers drop out on their own, which is exactly the best-effort
//! contract the frame format promises.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use crate::controller::Controller;

/// Broadcast capacity. Slow subscribers skip ahead rather than stall the
/// publisher.
const CHANNEL_CAPACITY: usize = 64;

/// Publish interval.
const INTERVAL: Duration = Duration::from_secs(1);

/// Handle for subscribing to telemetry and for pushing out-of-band events.
#[derive(Clone)]
pub struct TelemetryPublisher {
    tx: broadcast::Sender<String>,
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Sender clone for components that emit out-of-band events (e.g. the
    /// phase machine's transition-ready edge).
    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes one frame. Returns the number of receivers it reached.
    pub fn publish(&self, message: String) -> usize {
        // An Err here only means nobody is listening right now.
        self.tx.send(message).unwrap_or(0)
    }

    /// Periodic broadcast task. Runs until the shutdown channel fires.
    pub async fn run(
        self,
        controller: Arc<RwLock<Controller>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Telemetry publisher started");
        let mut interval = tokio::time::interval(INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.broadcast_frame(&controller).await {
                        error!("Telemetry frame failed: {e}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Telemetry publisher stopping");
                    break;
                }
            }
        }
    }

    async fn broadcast_frame(
        &self,
        controller: &Arc<RwLock<Controller>>,
    ) -> Result<(), crate::ControllerError> {
        let data = {
            let guard = controller.read().await;
            guard.telemetry_data().await?
        };

        let frame = protocol::TelemetryFrame::new(Utc::now(), data);
        let json = protocol::serialize_frame(&frame)?;
        let reached = self.publish(json);
        debug!("Telemetry frame delivered to {reached} subscriber(s)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = TelemetryPublisher::new();
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();

        assert_eq!(publisher.publish("frame".to_string()), 2);
        assert_eq!(rx1.recv().await.unwrap(), "frame");
        assert_eq!(rx2.recv().await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_forgotten() {
        let publisher = TelemetryPublisher::new();
        let rx = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        drop(rx);
        assert_eq!(publisher.publish("frame".to_string()), 0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let publisher = TelemetryPublisher::new();
        assert_eq!(publisher.publish("frame".to_string()), 0);
    }
}
