//! Error taxonomy for the connectivity core.
//!
//! Candidate- and adapter-level failures are absorbed where they happen and
//! retried; only a degraded broker connection, fully unavailable sources and
//! command failures travel up to the caller. Nothing here is fatal to the
//! process.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::registry::device::{Source, SwitchState};

/// One broker candidate could not be used. Recoverable by trying the next one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{candidate}: invalid candidate: {reason}")]
    InvalidCandidate { candidate: String, reason: String },

    #[error("{candidate}: broker refused connection: {reason}")]
    Refused { candidate: String, reason: String },

    #[error("{candidate}: connection error: {reason}")]
    Connection { candidate: String, reason: String },

    #[error("{candidate}: no ConnAck within {timeout:?}")]
    Timeout { candidate: String, timeout: Duration },

    #[error("{candidate}: session lost: {reason}")]
    SessionLost { candidate: String, reason: String },
}

/// Failure detail for one candidate of a negotiation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub candidate_index: usize,
    pub label: String,
    pub error: TransportError,
}

/// Every candidate failed during one negotiation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all {} broker candidates failed in cycle {cycle}{}", .failures.len(), LastFailure(.failures))]
pub struct NegotiationExhausted {
    pub cycle: u32,
    pub failures: Vec<CandidateFailure>,
}

struct LastFailure<'a>(&'a [CandidateFailure]);

impl fmt::Display for LastFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.last() {
            Some(failure) => write!(f, " (last: {})", failure.error),
            None => Ok(()),
        }
    }
}

/// One observation source could not be reached this cycle. Other sources
/// are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterUnavailable {
    #[error("{adapter} source has no target configured")]
    NoTarget { adapter: Source },

    #[error("{adapter} request failed: {reason}")]
    Request { adapter: Source, reason: String },

    #[error("{adapter} answered with HTTP {status}")]
    Status { adapter: Source, status: u16 },

    #[error("{adapter} reported failure: {reason}")]
    Rejected { adapter: Source, reason: String },

    #[error("{adapter} response could not be decoded: {reason}")]
    Decode { adapter: Source, reason: String },

    #[error("{adapter} broker connection is not live")]
    Disconnected { adapter: Source },
}

impl AdapterUnavailable {
    pub fn adapter(&self) -> Source {
        match self {
            AdapterUnavailable::NoTarget { adapter }
            | AdapterUnavailable::Request { adapter, .. }
            | AdapterUnavailable::Status { adapter, .. }
            | AdapterUnavailable::Rejected { adapter, .. }
            | AdapterUnavailable::Decode { adapter, .. }
            | AdapterUnavailable::Disconnected { adapter } => *adapter,
        }
    }
}

/// An inbound frame or row that cannot be turned into an observation.
/// Dropped and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedObservation {
    #[error("topic `{0}` does not match <namespace>/<device>/<kind>")]
    Topic(String),

    #[error("unsupported topic kind `{kind}` in `{topic}`")]
    Kind { topic: String, kind: String },

    #[error("payload {payload:?} on `{topic}` is not ON or OFF")]
    StatePayload { topic: String, payload: String },

    #[error("payload {payload:?} on `{topic}` is not a dotted-quad address")]
    AddressPayload { topic: String, payload: String },

    #[error("payload on `{0}` is not valid UTF-8")]
    Encoding(String),

    #[error("unknown state {0:?}")]
    State(String),

    #[error("row for `{0}` carries no timestamp")]
    MissingTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("device `{0}` is not known")]
    UnknownDevice(String),

    #[error("registry is shut down")]
    Closed,
}

/// Failure of a user-issued ON/OFF command. The optimistic marker has
/// already been reverted when one of these is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("device `{0}` is not known")]
    UnknownDevice(String),

    #[error("no control route to `{0}`")]
    NoRoute(String),

    #[error("delivery to `{device_id}` failed: {reason}")]
    Delivery { device_id: String, reason: String },

    #[error("`{device_id}` did not confirm {requested} within {timeout:?}")]
    Timeout {
        device_id: String,
        requested: SwitchState,
        timeout: Duration,
    },

    #[error("command for `{0}` was superseded by a newer command")]
    Superseded(String),

    #[error("command task for `{device_id}` aborted: {reason}")]
    Aborted { device_id: String, reason: String },

    #[error("registry is shut down")]
    RegistryClosed,
}

impl From<RegistryError> for CommandError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownDevice(device_id) => CommandError::UnknownDevice(device_id),
            RegistryError::Closed => CommandError::RegistryClosed,
        }
    }
}
