use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device_http::DeviceTarget;
use crate::error::RegistryError;
use crate::mqtt::frame::InboundFrame;
use crate::mqtt::topic_router::{Routed, TopicRouter};
use crate::registry::handle::ObservationSink;

/// Turns inbound broker frames into registry observations.
///
/// Malformed frames are logged and dropped; the listener keeps going.
pub struct MqttListener {
    router: TopicRouter,
    sink: ObservationSink,
    target: DeviceTarget,
}

impl MqttListener {
    pub fn new(router: TopicRouter, sink: ObservationSink, target: DeviceTarget) -> Self {
        Self {
            router,
            sink,
            target,
        }
    }

    pub async fn handle(&self, frame: &InboundFrame) -> Result<(), RegistryError> {
        match self.router.route(frame) {
            Ok(Routed::Observation(observation)) => self.sink.submit(observation).await,
            Ok(Routed::Announcement(announcement)) => {
                debug!(
                    "{} announced {}",
                    announcement.device_id, announcement.address
                );
                self.target.retarget(announcement.address);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping frame {}: {}", frame, e);
                Ok(())
            }
        }
    }

    pub fn spawn(
        self,
        mut frames: mpsc::Receiver<InboundFrame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("MQTT listener started on namespace {}", self.router.namespace());
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let Some(frame) = frame else {
                    debug!("Frame channel closed");
                    break;
                };
                if let Err(e) = self.handle(&frame).await {
                    debug!("Registry refused observation: {}", e);
                    break;
                }
            }
            info!("MQTT listener stopped");
        })
    }
}
