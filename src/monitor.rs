//! Process-wide wiring of the connectivity core.
//!
//! One [`Monitor`] owns the registry, the single broker negotiator, the
//! three observation adapters and the command dispatcher. Consumers read
//! snapshots and change streams from it and issue commands through it.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::dispatcher::{CommandDispatcher, CommandReport, CommandTicket};
use crate::config::AppConfig;
use crate::error::{AdapterUnavailable, CommandError};
use crate::mqtt::negotiator::{
    ConnectionNegotiator, NegotiatorHandle, NegotiatorSettings, NegotiatorStatus,
};
use crate::mqtt::probe::{Connector, MqttConnector};
use crate::mqtt::topic_router::TopicRouter;
use crate::registry::device::{Source, SwitchState};
use crate::registry::handle::{DeviceChange, RegistryHandle, RegistrySnapshot};
use crate::sources::database::DatabaseSource;
use crate::sources::device_http::{DeviceHttpClient, DeviceHttpSource, DeviceTarget};
use crate::sources::mqtt::MqttListener;
use crate::sources::poller::PollerHandle;
use crate::sources::AdapterHealth;

const FRAME_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Monitor {
    registry: RegistryHandle,
    negotiator: NegotiatorHandle,
    dispatcher: CommandDispatcher<DeviceHttpClient>,
    target: DeviceTarget,
    pollers: Vec<PollerHandle>,
    adapters_cancel: CancellationToken,
    registry_cancel: CancellationToken,
    adapter_tasks: Vec<JoinHandle<()>>,
    registry_task: JoinHandle<()>,
}

impl Monitor {
    /// Starts everything against the configured broker.
    pub fn start(config: &AppConfig) -> Result<Self> {
        Self::start_with(config, MqttConnector::new(&config.broker))
    }

    /// Starts everything with the given broker connector.
    pub fn start_with<C: Connector>(config: &AppConfig, connector: C) -> Result<Self> {
        info!("Starting monitor");
        let registry_cancel = CancellationToken::new();
        let adapters_cancel = CancellationToken::new();

        let (registry, registry_task) =
            RegistryHandle::spawn(&config.registry, registry_cancel.clone());
        let mut adapter_tasks = Vec::new();
        let mut pollers = Vec::new();

        // MQTT: negotiator -> frames -> listener -> registry
        let router = TopicRouter::new(config.broker.namespace.clone());
        let target = DeviceTarget::new(config.device_http.base_url.clone());
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let negotiator =
            ConnectionNegotiator::new(connector, NegotiatorSettings::from(&config.broker));
        let (negotiator, negotiator_task) = NegotiatorHandle::spawn(
            negotiator,
            router.subscriptions(),
            frames_tx,
            adapters_cancel.child_token(),
        );
        adapter_tasks.push(negotiator_task);

        let listener = MqttListener::new(
            router,
            registry.sink(Source::Mqtt, adapters_cancel.clone()),
            target.clone(),
        );
        adapter_tasks.push(listener.spawn(frames_rx, adapters_cancel.clone()));

        // Device HTTP: polled, and the control route for commands
        let http = DeviceHttpClient::new(&config.device_http, target.clone())
            .map_err(|e| eyre!("Failed to build device HTTP client: {}", e))?;
        let (poller, task) = PollerHandle::spawn(
            Arc::new(DeviceHttpSource::new(http.clone())),
            config.device_http.poll_interval(),
            registry.sink(Source::Http, adapters_cancel.clone()),
            adapters_cancel.child_token(),
        );
        pollers.push(poller);
        adapter_tasks.push(task);

        // Database: lowest priority backfill
        if config.database.enabled {
            let database = DatabaseSource::new(config.database.clone())
                .map_err(|e| eyre!("Failed to build database client: {}", e))?;
            let (poller, task) = PollerHandle::spawn(
                Arc::new(database),
                config.database.poll_interval(),
                registry.sink(Source::Database, adapters_cancel.clone()),
                adapters_cancel.child_token(),
            );
            pollers.push(poller);
            adapter_tasks.push(task);
        } else {
            info!("Database source disabled");
        }

        let dispatcher = CommandDispatcher::new(registry.clone(), Arc::new(http), &config.commands);

        Ok(Self {
            registry,
            negotiator,
            dispatcher,
            target,
            pollers,
            adapters_cancel,
            registry_cancel,
            adapter_tasks,
            registry_task,
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<RegistrySnapshot> {
        self.registry.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.registry.subscribe()
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn device_target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn negotiator_status(&self) -> NegotiatorStatus {
        self.negotiator.status()
    }

    pub fn watch_negotiator(&self) -> watch::Receiver<NegotiatorStatus> {
        self.negotiator.watch()
    }

    /// Health of every adapter, highest source priority first.
    pub fn adapter_health(&self) -> Vec<AdapterHealth> {
        let mut health = vec![mqtt_health(&self.negotiator.status())];
        health.extend(self.pollers.iter().map(PollerHandle::health));
        health
    }

    /// Manual retry of the broker connection from the first candidate.
    pub fn reconnect(&self) {
        self.negotiator.reconnect();
    }

    pub async fn dispatch(
        &self,
        device_id: &str,
        state: SwitchState,
    ) -> Result<CommandTicket, CommandError> {
        self.dispatcher.dispatch(device_id, state).await
    }

    pub async fn send(
        &self,
        device_id: &str,
        state: SwitchState,
    ) -> Result<CommandReport, CommandError> {
        self.dispatcher.send(device_id, state).await
    }

    /// The broker gave up retrying on its own.
    pub fn is_degraded(&self) -> bool {
        self.negotiator.status().is_degraded()
    }

    pub fn all_sources_unavailable(&self) -> bool {
        self.adapter_health().iter().all(|h| !h.available)
    }

    /// Stops the adapters first so nothing is enqueued into a stopped
    /// registry, then the registry.
    pub async fn shutdown(self) {
        info!("Shutting down monitor");
        self.adapters_cancel.cancel();
        for task in self.adapter_tasks {
            join(task).await;
        }
        self.registry_cancel.cancel();
        join(self.registry_task).await;
        info!("Monitor stopped");
    }
}

async fn join(task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Task ended abnormally: {}", e),
        Err(_) => debug!("Task did not stop within {:?}", SHUTDOWN_GRACE),
    }
}

fn mqtt_health(status: &NegotiatorStatus) -> AdapterHealth {
    let available = status.is_live();
    AdapterHealth {
        source: Source::Mqtt,
        available,
        last_error: (!available).then_some(AdapterUnavailable::Disconnected {
            adapter: Source::Mqtt,
        }),
        last_success_at: status.last_live_at,
        consecutive_failures: status.cycles_failed,
    }
}
