use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MalformedObservation;

/// Relay position as reported by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn as_token(self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }

    /// Strict wire decoding for status frames: only the literal `ON` / `OFF`
    /// tokens, surrounding whitespace ignored.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "ON" => Some(SwitchState::On),
            "OFF" => Some(SwitchState::Off),
            _ => None,
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

// Lenient parsing for rows and JSON bodies written by other tools.
impl FromStr for SwitchState {
    type Err = MalformedObservation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("on") {
            Ok(SwitchState::On)
        } else if trimmed.eq_ignore_ascii_case("off") {
            Ok(SwitchState::Off)
        } else {
            Err(MalformedObservation::State(s.to_string()))
        }
    }
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Mqtt,
    Http,
    Database,
}

impl Source {
    /// Tie-break rank for observations carrying the same timestamp.
    /// MQTT is pushed in real time, the database is a backfill poll.
    pub fn priority(self) -> u8 {
        match self {
            Source::Mqtt => 2,
            Source::Http => 1,
            Source::Database => 0,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Mqtt => f.write_str("mqtt"),
            Source::Http => f.write_str("http"),
            Source::Database => f.write_str("database"),
        }
    }
}

/// A single timestamped report of a device's state from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceObservation {
    pub device_id: String,
    pub state: SwitchState,
    pub observed_at: DateTime<Utc>,
    pub source: Source,
    /// Per-adapter monotonic counter, stamped when the adapter enqueues it.
    pub sequence: Option<u64>,
}

impl DeviceObservation {
    pub fn new(
        device_id: impl Into<String>,
        state: SwitchState,
        observed_at: DateTime<Utc>,
        source: Source,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            state,
            observed_at,
            source,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for DeviceObservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} via {} at {}",
            self.device_id,
            self.state,
            self.source,
            self.observed_at.format("%H:%M:%S%.3f")
        )
    }
}

/// Optimistic marker set while a user command waits for confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub intent_id: u64,
    pub requested_state: SwitchState,
    pub issued_at: DateTime<Utc>,
}

impl PendingCommand {
    /// An observation of the same device confirms the marker if it reports
    /// the requested state and is not older than the command.
    pub fn is_confirmed_by(&self, observation: &DeviceObservation) -> bool {
        observation.state == self.requested_state && observation.observed_at >= self.issued_at
    }
}

/// Canonical per-device record. Only the registry writes it; everybody else
/// gets clones out of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub display_name: Option<String>,
    pub current_state: SwitchState,
    pub last_state_change_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub last_observed_source: Source,
    pub last_sequence: Option<u64>,
    pub onliness_deadline: DateTime<Utc>,
    pub pending: Option<PendingCommand>,
}

impl Device {
    pub(crate) fn from_observation(
        observation: &DeviceObservation,
        display_name: Option<String>,
        offline_threshold: TimeDelta,
    ) -> Self {
        Self {
            device_id: observation.device_id.clone(),
            display_name,
            current_state: observation.state,
            last_state_change_at: observation.observed_at,
            last_observed_at: observation.observed_at,
            last_observed_source: observation.source,
            last_sequence: observation.sequence,
            onliness_deadline: deadline(observation.observed_at, offline_threshold),
            pending: None,
        }
    }

    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        now < self.onliness_deadline
    }

    pub fn is_online(&self) -> bool {
        self.is_online_at(Utc::now())
    }

    /// What a UI should draw: the requested state while a command is
    /// unconfirmed, the authoritative state otherwise.
    pub fn displayed_state(&self) -> SwitchState {
        self.pending
            .as_ref()
            .map(|pending| pending.requested_state)
            .unwrap_or(self.current_state)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

pub(crate) fn deadline(observed_at: DateTime<Utc>, threshold: TimeDelta) -> DateTime<Utc> {
    observed_at
        .checked_add_signed(threshold)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
