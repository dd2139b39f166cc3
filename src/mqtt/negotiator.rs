//! Broker connection negotiation and supervision.
//!
//! A negotiation cycle walks the ordered candidate list, one probe at a
//! time, each bounded by the per-candidate timeout. The first broker that
//! acknowledges wins; if none does, the cycle ends in exactly one
//! [`NegotiationExhausted`].
//!
//! The supervisor task owned by [`NegotiatorHandle`] repeats cycles with a
//! fixed delay, serves the live session (subscriptions and inbound frames)
//! and goes `Degraded` after `max_cycles` exhausted cycles in a row. Only
//! one session object exists at any time: a lost or replaced session is
//! closed before the next probe opens.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerConfig, TransportCandidate};
use super::frame::InboundFrame;
use super::probe::{Connector, Session};
use crate::error::{CandidateFailure, NegotiationExhausted, TransportError};
use crate::registry::device::to_time_delta;

#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    pub candidates: Vec<TransportCandidate>,
    pub candidate_timeout: Duration,
    pub retry_delay: Duration,
    pub max_cycles: u32,
    /// A session that drops before this long counts as a failed cycle.
    pub stable_after: Duration,
}

impl From<&BrokerConfig> for NegotiatorSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            candidates: config.candidates.clone(),
            candidate_timeout: config.candidate_timeout(),
            retry_delay: config.retry_delay(),
            max_cycles: config.max_cycles.max(1),
            stable_after: config.candidate_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Connecting,
    Live,
    Failed,
}

/// One probe of one candidate. Replaced wholesale for every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub candidate_index: usize,
    pub label: String,
    pub status: AttemptStatus,
    pub last_error: Option<TransportError>,
    pub attempt_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Phase {
    #[default]
    Idle,
    Negotiating {
        cycle: u32,
    },
    Live {
        candidate_index: usize,
        label: String,
    },
    Backoff {
        cycle: u32,
        retry_at: DateTime<Utc>,
    },
    /// Automatic retry has stopped; waits for a manual reconnect.
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct NegotiatorStatus {
    pub phase: Phase,
    pub attempt: Option<ConnectionState>,
    /// Failed cycles since the last stable session or manual reconnect.
    /// Sessions that drop before `stable_after` count as failed cycles.
    pub cycles_failed: u32,
    pub last_failure: Option<NegotiationExhausted>,
    /// When the most recent session came up.
    pub last_live_at: Option<DateTime<Utc>>,
    /// Inbound frames discarded because the consumer could not keep up.
    pub frames_dropped: u64,
}

impl NegotiatorStatus {
    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live { .. })
    }

    pub fn is_degraded(&self) -> bool {
        self.phase == Phase::Degraded
    }
}

/// The winning session of a cycle.
pub struct LiveConnection<S> {
    pub candidate_index: usize,
    pub label: String,
    pub session: S,
}

pub struct ConnectionNegotiator<C: Connector> {
    connector: C,
    settings: NegotiatorSettings,
    status: watch::Sender<NegotiatorStatus>,
}

impl<C: Connector> ConnectionNegotiator<C> {
    pub fn new(connector: C, settings: NegotiatorSettings) -> Self {
        let (status, _) = watch::channel(NegotiatorStatus::default());
        Self {
            connector,
            settings,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<NegotiatorStatus> {
        self.status.subscribe()
    }

    pub fn settings(&self) -> &NegotiatorSettings {
        &self.settings
    }

    /// Runs one full pass over the candidate list.
    ///
    /// A timed-out probe is dropped, which releases whatever it had opened,
    /// before the next candidate starts.
    pub async fn negotiate_cycle(
        &self,
        cycle: u32,
    ) -> Result<LiveConnection<C::Session>, NegotiationExhausted> {
        self.status
            .send_modify(|status| status.phase = Phase::Negotiating { cycle });

        let mut failures = Vec::new();
        for (index, candidate) in self.settings.candidates.iter().enumerate() {
            let label = candidate.name();
            self.set_attempt(ConnectionState {
                candidate_index: index,
                label: label.clone(),
                status: AttemptStatus::Connecting,
                last_error: None,
                attempt_started_at: Utc::now(),
            });

            let result = tokio::time::timeout(
                self.settings.candidate_timeout,
                self.connector.connect(index, candidate),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    candidate: label.clone(),
                    timeout: self.settings.candidate_timeout,
                })
            });

            match result {
                Ok(session) => {
                    info!("Broker live via candidate {} ({})", index, label);
                    self.status.send_modify(|status| {
                        if let Some(attempt) = status.attempt.as_mut() {
                            attempt.status = AttemptStatus::Live;
                        }
                    });
                    return Ok(LiveConnection {
                        candidate_index: index,
                        label,
                        session,
                    });
                }
                Err(e) => {
                    warn!("Candidate {} failed: {}", index, e);
                    self.status.send_modify(|status| {
                        if let Some(attempt) = status.attempt.as_mut() {
                            attempt.status = AttemptStatus::Failed;
                            attempt.last_error = Some(e.clone());
                        }
                    });
                    failures.push(CandidateFailure {
                        candidate_index: index,
                        label,
                        error: e,
                    });
                }
            }
        }

        Err(NegotiationExhausted { cycle, failures })
    }

    fn set_attempt(&self, attempt: ConnectionState) {
        self.status
            .send_modify(|status| status.attempt = Some(attempt));
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_modify(|status| status.phase = phase);
    }

    async fn run(
        self,
        subscriptions: Vec<String>,
        frames: mpsc::Sender<InboundFrame>,
        reconnect: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        info!(
            "Negotiator started with {} candidates",
            self.settings.candidates.len()
        );
        let mut cycle = 0u32;

        loop {
            cycle += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = reconnect.notified() => {
                    self.reset_failures("during negotiation");
                    continue;
                }
                outcome = self.negotiate_cycle(cycle) => outcome,
            };

            match outcome {
                Ok(live) => {
                    let label = live.label.clone();
                    self.status.send_modify(|status| {
                        status.phase = Phase::Live {
                            candidate_index: live.candidate_index,
                            label: live.label.clone(),
                        };
                        status.last_live_at = Some(Utc::now());
                    });
                    match self
                        .serve(live, &subscriptions, &frames, &reconnect, &cancel)
                        .await
                    {
                        Served::Cancelled => break,
                        Served::Reconnect => self.reset_failures("while live"),
                        Served::Lost { error, stable: true } => {
                            warn!("Broker session lost: {}", error)
                        }
                        Served::Lost {
                            error,
                            stable: false,
                        } => {
                            warn!(
                                "Broker session {} dropped within {:?}: {}",
                                label, self.settings.stable_after, error
                            );
                            self.status
                                .send_modify(|status| status.cycles_failed += 1);
                            if self.wait_after_failure(cycle, &reconnect, &cancel).await {
                                break;
                            }
                        }
                    }
                }
                Err(exhausted) => {
                    warn!("{}", exhausted);
                    self.status.send_modify(|status| {
                        status.cycles_failed += 1;
                        status.last_failure = Some(exhausted);
                    });
                    if self.wait_after_failure(cycle, &reconnect, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_phase(Phase::Stopped);
        info!("Negotiator stopped");
    }

    /// Backs off after a failed cycle, or parks in `Degraded` once
    /// `max_cycles` is reached. Returns true if cancelled.
    async fn wait_after_failure(
        &self,
        cycle: u32,
        reconnect: &Notify,
        cancel: &CancellationToken,
    ) -> bool {
        let failed = self.status.borrow().cycles_failed;
        if failed >= self.settings.max_cycles {
            error!(
                "Broker unreachable after {} cycles, waiting for manual reconnect",
                failed
            );
            self.set_phase(Phase::Degraded);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                _ = reconnect.notified() => self.reset_failures("while degraded"),
            }
            return false;
        }

        let retry_at = Utc::now() + to_time_delta(self.settings.retry_delay);
        self.set_phase(Phase::Backoff { cycle, retry_at });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return true,
            _ = reconnect.notified() => self.reset_failures("during backoff"),
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
        }
        false
    }

    async fn serve(
        &self,
        mut live: LiveConnection<C::Session>,
        subscriptions: &[String],
        frames: &mpsc::Sender<InboundFrame>,
        reconnect: &Notify,
        cancel: &CancellationToken,
    ) -> Served {
        for filter in subscriptions {
            if let Err(e) = live.session.subscribe(filter).await {
                live.session.close().await;
                self.mark_closed(&e);
                return Served::Lost {
                    error: e,
                    stable: false,
                };
            }
            debug!("Subscribed {} on {}", filter, live.label);
        }

        let stable_at = Instant::now() + self.settings.stable_after;
        let mut stable = false;
        let served = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Served::Cancelled,
                _ = reconnect.notified() => break Served::Reconnect,
                _ = tokio::time::sleep_until(stable_at), if !stable => {
                    stable = true;
                    self.status.send_if_modified(|status| {
                        std::mem::replace(&mut status.cycles_failed, 0) != 0
                    });
                    debug!("Broker session {} is stable", live.label);
                }
                frame = live.session.next_frame() => match frame {
                    // Never block here: the session has to keep polling to
                    // answer keep-alives.
                    Ok(frame) => match frames.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(frame)) => {
                            warn!("Frame consumer lagging, dropping {}", frame);
                            self.status.send_modify(|status| status.frames_dropped += 1);
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("Frame consumer gone, releasing broker session");
                            break Served::Cancelled;
                        }
                    },
                    Err(error) => break Served::Lost { error, stable },
                },
            }
        };

        live.session.close().await;
        let reason = match &served {
            Served::Lost { error, .. } => error.clone(),
            _ => TransportError::SessionLost {
                candidate: live.label.clone(),
                reason: "closed locally".to_string(),
            },
        };
        self.mark_closed(&reason);
        served
    }

    fn mark_closed(&self, reason: &TransportError) {
        self.status.send_modify(|status| {
            if let Some(attempt) = status.attempt.as_mut() {
                attempt.status = AttemptStatus::Failed;
                attempt.last_error = Some(reason.clone());
            }
        });
    }

    fn reset_failures(&self, context: &str) {
        info!("Manual reconnect requested {}", context);
        self.status.send_modify(|status| {
            status.cycles_failed = 0;
            status.attempt = None;
        });
    }
}

enum Served {
    Cancelled,
    Reconnect,
    Lost { error: TransportError, stable: bool },
}

/// Control surface for the process-wide negotiator task.
#[derive(Clone)]
pub struct NegotiatorHandle {
    status: watch::Receiver<NegotiatorStatus>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
}

impl NegotiatorHandle {
    /// Starts the supervisor. Inbound frames from whichever session is live
    /// are forwarded on `frames`.
    pub fn spawn<C: Connector>(
        negotiator: ConnectionNegotiator<C>,
        subscriptions: Vec<String>,
        frames: mpsc::Sender<InboundFrame>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let status = negotiator.status();
        let reconnect = Arc::new(Notify::new());
        let task = tokio::spawn(negotiator.run(
            subscriptions,
            frames,
            reconnect.clone(),
            cancel.clone(),
        ));
        (
            Self {
                status,
                reconnect,
                cancel,
            },
            task,
        )
    }

    pub fn status(&self) -> NegotiatorStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NegotiatorStatus> {
        self.status.clone()
    }

    /// Resets the failure counter, drops any live session and restarts at
    /// candidate 0.
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
