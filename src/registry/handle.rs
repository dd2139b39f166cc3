//! Registry actor: the only writer of the device table.
//!
//! Producers enqueue onto one bounded mpsc queue and the actor applies each
//! command to completion before taking the next, so reconciliation is atomic
//! per observation without locks. Readers get an immutable snapshot through
//! a `watch` channel and a change stream through `broadcast`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{Device, DeviceObservation, PendingCommand, Source, SwitchState};
use super::reconcile::{DeviceTable, Verdict};
use crate::error::RegistryError;

const CHANGE_BUFFER: usize = 256;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Staleness after which a device counts as offline.
    pub offline_threshold_ms: u64,
    /// Capacity of the shared ingress queue.
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            offline_threshold_ms: 120_000,
            queue_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_threshold_ms)
    }
}

/// Immutable view of every known device.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub devices: BTreeMap<String, Device>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn online_at(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(move |d| d.is_online_at(now))
    }

    pub fn switched_on(&self) -> usize {
        self.devices
            .values()
            .filter(|d| d.displayed_state() == SwitchState::On)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Discovered,
    StateChanged { previous: SwitchState },
    Observed,
    Renamed,
    CommandPending { intent_id: u64 },
    CommandConfirmed { intent_id: u64 },
    CommandReverted { intent_id: u64 },
}

/// Push notification carrying the device as it looks after the change.
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub device: Device,
    pub kind: ChangeKind,
}

pub(crate) enum RegistryCommand {
    Observe(DeviceObservation),
    Annotate {
        device_id: String,
        display_name: String,
    },
    BeginPending {
        device_id: String,
        pending: PendingCommand,
        confirm: oneshot::Sender<DeviceObservation>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    ExpirePending {
        device_id: String,
        intent_id: u64,
        reply: oneshot::Sender<bool>,
    },
}

/// Cheap, cloneable access to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    snapshots: watch::Receiver<RegistrySnapshot>,
    changes: broadcast::Sender<DeviceChange>,
}

impl RegistryHandle {
    pub fn spawn(config: &RegistryConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        info!(
            "Starting device registry (offline threshold {:?}, queue {})",
            config.offline_threshold(),
            config.queue_capacity
        );

        let (commands, inbox) = mpsc::channel(config.queue_capacity.max(1));
        let (snapshot_tx, snapshots) = watch::channel(RegistrySnapshot::default());
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        let actor = RegistryActor {
            table: DeviceTable::new(config.offline_threshold()),
            inbox,
            snapshot_tx,
            changes: changes.clone(),
            waiters: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(cancel));

        (
            Self {
                commands,
                snapshots,
                changes,
            },
            task,
        )
    }

    /// Ingress endpoint for one adapter. Submissions stop being accepted once
    /// `cancel` fires.
    pub fn sink(&self, source: Source, cancel: CancellationToken) -> ObservationSink {
        ObservationSink {
            source,
            commands: self.commands.clone(),
            sequence: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.snapshots.borrow().get(device_id).cloned()
    }

    pub fn watch(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn observe(&self, observation: DeviceObservation) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Observe(observation)).await
    }

    pub async fn annotate(
        &self,
        device_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Annotate {
            device_id: device_id.into(),
            display_name: display_name.into(),
        })
        .await
    }

    /// Sets the optimistic marker. The returned receiver yields the
    /// observation that confirms it; it errors if the marker is replaced by a
    /// newer command or the registry stops.
    pub(crate) async fn begin_pending(
        &self,
        device_id: &str,
        pending: PendingCommand,
    ) -> Result<oneshot::Receiver<DeviceObservation>, RegistryError> {
        let (confirm, confirmed) = oneshot::channel();
        let (reply, response) = oneshot::channel();
        self.send(RegistryCommand::BeginPending {
            device_id: device_id.to_string(),
            pending,
            confirm,
            reply,
        })
        .await?;
        response.await.map_err(|_| RegistryError::Closed)??;
        Ok(confirmed)
    }

    /// Reverts the optimistic marker if it still belongs to `intent_id`.
    /// Returns false when it was already confirmed or replaced.
    pub(crate) async fn expire_pending(
        &self,
        device_id: &str,
        intent_id: u64,
    ) -> Result<bool, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(RegistryCommand::ExpirePending {
            device_id: device_id.to_string(),
            intent_id,
            reply,
        })
        .await?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    async fn send(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RegistryError::Closed)
    }
}

/// Write-only endpoint handed to one adapter. Stamps the adapter's
/// sequence numbers so per-source FIFO order is visible downstream.
#[derive(Clone)]
pub struct ObservationSink {
    source: Source,
    commands: mpsc::Sender<RegistryCommand>,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ObservationSink {
    pub fn source(&self) -> Source {
        self.source
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    pub async fn submit(&self, mut observation: DeviceObservation) -> Result<(), RegistryError> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Closed);
        }
        if observation.source != self.source {
            warn!(
                "{} sink received an observation tagged {}, retagging",
                self.source, observation.source
            );
            observation.source = self.source;
        }
        if observation.sequence.is_none() {
            observation.sequence = Some(self.sequence.fetch_add(1, Ordering::Relaxed));
        }
        self.commands
            .send(RegistryCommand::Observe(observation))
            .await
            .map_err(|_| RegistryError::Closed)
    }

    pub async fn annotate(
        &self,
        device_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<(), RegistryError> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Closed);
        }
        self.commands
            .send(RegistryCommand::Annotate {
                device_id: device_id.into(),
                display_name: display_name.into(),
            })
            .await
            .map_err(|_| RegistryError::Closed)
    }
}

struct RegistryActor {
    table: DeviceTable,
    inbox: mpsc::Receiver<RegistryCommand>,
    snapshot_tx: watch::Sender<RegistrySnapshot>,
    changes: broadcast::Sender<DeviceChange>,
    // device id -> (intent id, confirmation channel)
    waiters: HashMap<String, (u64, oneshot::Sender<DeviceObservation>)>,
}

impl RegistryActor {
    async fn run(mut self, cancel: CancellationToken) {
        info!("Device registry task started");
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.inbox.recv() => command,
            };
            match command {
                Some(command) => self.handle(command),
                None => {
                    debug!("All registry producers dropped");
                    break;
                }
            }
        }
        self.inbox.close();
        info!(
            "Device registry stopped with {} known devices",
            self.table.len()
        );
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Observe(observation) => self.observe(observation),
            RegistryCommand::Annotate {
                device_id,
                display_name,
            } => {
                if self.table.annotate(&device_id, &display_name) {
                    self.publish(&device_id, ChangeKind::Renamed);
                }
            }
            RegistryCommand::BeginPending {
                device_id,
                pending,
                confirm,
                reply,
            } => {
                let intent_id = pending.intent_id;
                let result = self.table.begin_pending(&device_id, pending);
                let outcome = match result {
                    Ok(replaced) => {
                        if let Some(replaced) = replaced {
                            debug!(
                                "Command {} for {} superseded by {}",
                                replaced.intent_id, device_id, intent_id
                            );
                        }
                        // Dropping the previous waiter tells it it was superseded.
                        self.waiters
                            .insert(device_id.clone(), (intent_id, confirm));
                        self.publish(&device_id, ChangeKind::CommandPending { intent_id });
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                if reply.send(outcome).is_err() {
                    warn!("Command issuer for {} went away", device_id);
                }
            }
            RegistryCommand::ExpirePending {
                device_id,
                intent_id,
                reply,
            } => {
                let reverted = self.table.expire_pending(&device_id, intent_id);
                if reverted {
                    if self
                        .waiters
                        .get(&device_id)
                        .is_some_and(|(waiting, _)| *waiting == intent_id)
                    {
                        self.waiters.remove(&device_id);
                    }
                    self.publish(&device_id, ChangeKind::CommandReverted { intent_id });
                }
                let _ = reply.send(reverted);
            }
        }
    }

    fn observe(&mut self, observation: DeviceObservation) {
        let applied = self.table.apply(&observation);
        let device_id = observation.device_id.as_str();

        match &applied.verdict {
            Verdict::Created => {
                info!("Discovered device {}", observation);
                self.publish(device_id, ChangeKind::Discovered);
            }
            Verdict::StateChanged { previous } => {
                info!("State change {} -> {}", previous, observation);
                self.publish(
                    device_id,
                    ChangeKind::StateChanged {
                        previous: *previous,
                    },
                );
            }
            Verdict::Refreshed => {
                debug!("Refreshed {}", observation);
                self.publish(device_id, ChangeKind::Observed);
            }
            Verdict::Rejected(rejection) => {
                debug!("Ignoring {}: {:?}", observation, rejection);
            }
        }

        if let Some(confirmed) = applied.confirmed {
            info!(
                "Command {} for {} confirmed via {}",
                confirmed.intent_id, device_id, observation.source
            );
            if let Some((intent_id, waiter)) = self.waiters.remove(device_id) {
                if intent_id == confirmed.intent_id && waiter.send(observation.clone()).is_err() {
                    debug!("Waiter for command {} already gone", intent_id);
                }
            }
            self.publish(
                device_id,
                ChangeKind::CommandConfirmed {
                    intent_id: confirmed.intent_id,
                },
            );
        }
    }

    fn publish(&self, device_id: &str, kind: ChangeKind) {
        self.snapshot_tx.send_replace(RegistrySnapshot {
            devices: self.table.snapshot(),
            taken_at: Some(Utc::now()),
        });

        let Some(device) = self.table.get(device_id).cloned() else {
            error!("Change published for unknown device {}", device_id);
            return;
        };
        // No subscribers is fine; snapshots still carry the state.
        let _ = self.changes.send(DeviceChange { device, kind });
    }
}
