//! # Observation Sources
//!
//! Three independent adapters feed the registry, each with its own task and
//! its own failure domain:
//!
//! - [`mqtt::MqttListener`] - push, real time, drains the negotiator's frames
//! - [`device_http::DeviceHttpSource`] - point-in-time poll of the board's API
//! - [`database::DatabaseSource`] - historical backfill from the event table
//!
//! Polled sources implement [`PollSource`] and are driven by
//! [`poller::PollerHandle`]. A source that cannot be reached reports
//! [`AdapterUnavailable`] and contributes nothing that cycle; silence is never
//! turned into an OFF observation.

pub mod database;
pub mod device_http;
pub mod mqtt;
pub mod poller;

#[cfg(test)]
pub(crate) mod test_http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AdapterUnavailable;
use crate::registry::device::{DeviceObservation, Source};

/// What one successful poll produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePoll {
    /// In the order the source produced them; submitted FIFO.
    pub observations: Vec<DeviceObservation>,
    /// `(device_id, display_name)` pairs.
    pub display_names: Vec<(String, String)>,
}

#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    fn source(&self) -> Source;

    async fn poll(&self) -> Result<SourcePoll, AdapterUnavailable>;
}

/// Availability of one adapter as last observed by its task.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterHealth {
    pub source: Source,
    pub available: bool,
    pub last_error: Option<AdapterUnavailable>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl AdapterHealth {
    /// Not yet polled. Counts as unavailable until the first success.
    pub fn new(source: Source) -> Self {
        Self {
            source,
            available: false,
            last_error: None,
            last_success_at: None,
            consecutive_failures: 0,
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.available = true;
        self.last_error = None;
        self.last_success_at = Some(Utc::now());
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self, error: AdapterUnavailable) {
        self.available = false;
        self.last_error = Some(error);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}
