//! Optimistic ON/OFF commands.
//!
//! `dispatch` marks the device pending in the registry right away, then a
//! per-command task delivers the request and waits for the observation that
//! confirms it. The marker is always resolved by that task: confirmed by an
//! observation, or reverted on delivery failure or timeout. Dropping the
//! ticket does not leave the marker behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::intent::{CommandIntent, Confirmed, Pending};
use crate::error::CommandError;
use crate::registry::device::{DeviceObservation, Source, SwitchState};
use crate::registry::handle::RegistryHandle;

/// Out-of-band route to a device. The broker is status-only, so this is
/// the board's HTTP control endpoint in practice.
#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    async fn deliver(&self, device_id: &str, state: SwitchState) -> Result<(), CommandError>;
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub confirm_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 10_000,
        }
    }
}

impl CommandConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub intent_id: u64,
    pub device_id: String,
    pub requested_state: SwitchState,
    pub confirmed_by: Source,
    pub confirmed_at: DateTime<Utc>,
}

/// Handle on an in-flight command.
pub struct CommandTicket {
    intent_id: u64,
    device_id: String,
    outcome: oneshot::Receiver<Result<CommandReport, CommandError>>,
}

impl CommandTicket {
    pub fn intent_id(&self) -> u64 {
        self.intent_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn outcome(self) -> Result<CommandReport, CommandError> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(CommandError::Aborted {
                device_id: self.device_id,
                reason: "command task ended without a result".to_string(),
            })
        })
    }
}

pub struct CommandDispatcher<C: ControlChannel> {
    registry: RegistryHandle,
    channel: Arc<C>,
    confirm_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl<C: ControlChannel> Clone for CommandDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            channel: self.channel.clone(),
            confirm_timeout: self.confirm_timeout,
            next_id: self.next_id.clone(),
        }
    }
}

impl<C: ControlChannel> CommandDispatcher<C> {
    pub fn new(registry: RegistryHandle, channel: Arc<C>, config: &CommandConfig) -> Self {
        Self {
            registry,
            channel,
            confirm_timeout: config.confirm_timeout(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Marks the device pending and starts delivery. Fails right away only if
    /// the device is unknown or the registry is gone.
    pub async fn dispatch(
        &self,
        device_id: &str,
        requested_state: SwitchState,
    ) -> Result<CommandTicket, CommandError> {
        let intent = CommandIntent::issue(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            device_id,
            requested_state,
        );
        let confirmed = self.registry.begin_pending(device_id, intent.marker()).await?;
        info!(
            "Command {}: {} -> {} (pending)",
            intent.intent_id(),
            device_id,
            requested_state
        );

        let (tx, rx) = oneshot::channel();
        let ticket = CommandTicket {
            intent_id: intent.intent_id(),
            device_id: device_id.to_string(),
            outcome: rx,
        };

        let resolver = Resolver {
            registry: self.registry.clone(),
            channel: self.channel.clone(),
            deadline: Instant::now() + self.confirm_timeout,
            timeout: self.confirm_timeout,
        };
        tokio::spawn(async move {
            let outcome = resolver.resolve(intent, confirmed).await;
            if tx.send(outcome).is_err() {
                debug!("Command ticket dropped before resolution");
            }
        });

        Ok(ticket)
    }

    /// Dispatches and waits for confirmation.
    pub async fn send(
        &self,
        device_id: &str,
        requested_state: SwitchState,
    ) -> Result<CommandReport, CommandError> {
        self.dispatch(device_id, requested_state)
            .await?
            .outcome()
            .await
    }
}

struct Resolver<C: ControlChannel> {
    registry: RegistryHandle,
    channel: Arc<C>,
    deadline: Instant,
    timeout: Duration,
}

impl<C: ControlChannel> Resolver<C> {
    async fn resolve(
        self,
        intent: CommandIntent<Pending>,
        mut confirmed: oneshot::Receiver<DeviceObservation>,
    ) -> Result<CommandReport, CommandError> {
        let delivery = tokio::time::timeout_at(
            self.deadline,
            self.channel
                .deliver(intent.device_id(), intent.requested_state()),
        )
        .await;

        match delivery {
            Ok(Ok(())) => debug!("Command {} delivered", intent.intent_id()),
            Ok(Err(e)) => {
                warn!("Command {} not delivered: {}", intent.intent_id(), e);
                return self.revert(intent, &mut confirmed, e).await;
            }
            Err(_) => {
                let timeout = self.timeout_error(&intent);
                return self.revert(intent, &mut confirmed, timeout).await;
            }
        }

        tokio::select! {
            observation = &mut confirmed => match observation {
                Ok(observation) => Ok(Self::confirmed(intent, observation)),
                Err(_) if self.registry.is_closed() => Err(CommandError::RegistryClosed),
                Err(_) => Err(CommandError::Superseded(intent.device_id().to_string())),
            },
            _ = tokio::time::sleep_until(self.deadline) => {
                let timeout = self.timeout_error(&intent);
                self.revert(intent, &mut confirmed, timeout).await
            }
        }
    }

    /// Reverts the marker unless it was confirmed or replaced in the
    /// meantime.
    async fn revert(
        &self,
        intent: CommandIntent<Pending>,
        confirmed: &mut oneshot::Receiver<DeviceObservation>,
        failure: CommandError,
    ) -> Result<CommandReport, CommandError> {
        let reverted = self
            .registry
            .expire_pending(intent.device_id(), intent.intent_id())
            .await?;

        if reverted {
            let timed_out = intent.time_out();
            warn!(
                "Command {} for {} reverted: {}",
                timed_out.intent_id(),
                timed_out.device_id(),
                failure
            );
            return Err(failure);
        }

        match confirmed.try_recv() {
            Ok(observation) => Ok(Self::confirmed(intent, observation)),
            Err(_) => Err(CommandError::Superseded(intent.device_id().to_string())),
        }
    }

    fn confirmed(intent: CommandIntent<Pending>, observation: DeviceObservation) -> CommandReport {
        let report = CommandReport {
            intent_id: intent.intent_id(),
            device_id: intent.device_id().to_string(),
            requested_state: intent.requested_state(),
            confirmed_by: observation.source,
            confirmed_at: observation.observed_at,
        };
        let intent: CommandIntent<Confirmed> = intent.confirm(observation);
        if let Some(observation) = intent.confirmation() {
            info!("Command {} confirmed by {}", intent.intent_id(), observation);
        }
        report
    }

    fn timeout_error(&self, intent: &CommandIntent<Pending>) -> CommandError {
        CommandError::Timeout {
            device_id: intent.device_id().to_string(),
            requested: intent.requested_state(),
            timeout: self.timeout,
        }
    }
}
