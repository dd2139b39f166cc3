//! Fixed-interval driver for one [`PollSource`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AdapterHealth, PollSource};
use crate::registry::handle::ObservationSink;

pub struct PollerHandle {
    health: watch::Receiver<AdapterHealth>,
    cancel: CancellationToken,
}

impl PollerHandle {
    /// Polls `source` immediately and then every `interval` until `cancel`
    /// fires. Nothing is submitted to `sink` after cancellation.
    pub fn spawn<P: PollSource>(
        source: Arc<P>,
        interval: Duration,
        sink: ObservationSink,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (health_tx, health) = watch::channel(AdapterHealth::new(source.source()));
        let task = tokio::spawn(run(source, interval, sink, health_tx, cancel.clone()));
        (Self { health, cancel }, task)
    }

    pub fn health(&self) -> AdapterHealth {
        self.health.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<AdapterHealth> {
        self.health.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run<P: PollSource>(
    source: Arc<P>,
    interval: Duration,
    sink: ObservationSink,
    health: watch::Sender<AdapterHealth>,
    cancel: CancellationToken,
) {
    let name = source.source();
    info!("Starting {} poller with interval {:?}", name, interval);

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = source.poll() => polled,
        };

        match polled {
            Ok(poll) => {
                debug!(
                    "{} poll returned {} observations",
                    name,
                    poll.observations.len()
                );
                for (device_id, display_name) in poll.display_names {
                    if sink.annotate(device_id, display_name).await.is_err() {
                        break;
                    }
                }
                for observation in poll.observations {
                    if let Err(e) = sink.submit(observation).await {
                        debug!("{} sink closed: {}", name, e);
                        break;
                    }
                }
                health.send_modify(AdapterHealth::record_success);
            }
            Err(e) => {
                let failures = health.borrow().consecutive_failures + 1;
                if failures == 1 {
                    warn!("{} unavailable: {}", name, e);
                } else {
                    debug!("{} still unavailable ({} cycles): {}", name, failures, e);
                }
                health.send_modify(|h| h.record_failure(e));
            }
        }

        if sink.is_closed() {
            break;
        }
    }

    info!("{} poller stopped", name);
}
