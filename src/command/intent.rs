//! Lifecycle of one user-issued ON/OFF command.
//!
//! `Pending -> Confirmed | TimedOut`, enforced by the type system: only a
//! pending intent can be confirmed or timed out, and each resolution
//! consumes it.

use chrono::{DateTime, Utc};
use statum::{machine, state};

use crate::registry::device::{DeviceObservation, PendingCommand, SwitchState};

#[state]
#[derive(Debug, Clone)]
pub enum IntentState {
    Pending,
    Confirmed(DeviceObservation),
    TimedOut,
}

#[machine]
#[derive(Debug)]
pub struct CommandIntent<S: IntentState> {
    intent_id: u64,
    device_id: String,
    requested_state: SwitchState,
    issued_at: DateTime<Utc>,
}

impl<S: IntentState> CommandIntent<S> {
    pub fn intent_id(&self) -> u64 {
        self.intent_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn requested_state(&self) -> SwitchState {
        self.requested_state
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl CommandIntent<Pending> {
    pub fn issue(intent_id: u64, device_id: impl Into<String>, requested_state: SwitchState) -> Self {
        Self::new(intent_id, device_id.into(), requested_state, Utc::now())
    }

    /// The optimistic marker the registry shows while this is unresolved.
    pub fn marker(&self) -> PendingCommand {
        PendingCommand {
            intent_id: self.intent_id,
            requested_state: self.requested_state,
            issued_at: self.issued_at,
        }
    }

    pub fn confirm(self, observation: DeviceObservation) -> CommandIntent<Confirmed> {
        self.transition_with(observation)
    }

    pub fn time_out(self) -> CommandIntent<TimedOut> {
        self.transition()
    }
}

impl CommandIntent<Confirmed> {
    pub fn confirmation(&self) -> Option<&DeviceObservation> {
        self.get_state_data()
    }
}
