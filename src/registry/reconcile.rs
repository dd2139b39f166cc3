//! Reconciliation of observations into the canonical device table.
//!
//! Wall-clock freshness is the primary key: an observation is accepted only
//! if it is at least as recent as the last accepted one. Source priority
//! (MQTT > HTTP > DATABASE) breaks exact timestamp ties, and the per-adapter
//! sequence breaks ties within one source. The table is a plain synchronous
//! structure; serialisation of writers happens in [`super::handle`].

use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::device::{
    deadline, to_time_delta, Device, DeviceObservation, PendingCommand, Source, SwitchState,
};
use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// First accepted observation for this device.
    Created,
    /// Accepted and the state flipped.
    StateChanged { previous: SwitchState },
    /// Accepted, same state as before.
    Refreshed,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Verdict::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Older than the last accepted observation.
    Stale { last_observed_at: DateTime<Utc> },
    /// Same timestamp, but the current holder has higher priority.
    OutrankedBy { holder: Source },
    /// Same timestamp and source, older sequence number.
    OutOfSequence { last_sequence: u64 },
}

#[derive(Debug, Clone)]
pub struct Applied {
    pub verdict: Verdict,
    /// Pending command confirmed by this observation, if any.
    pub confirmed: Option<PendingCommand>,
}

#[derive(Debug)]
pub struct DeviceTable {
    devices: HashMap<String, Device>,
    display_names: HashMap<String, String>,
    offline_threshold: TimeDelta,
}

impl DeviceTable {
    pub fn new(offline_threshold: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            display_names: HashMap::new(),
            offline_threshold: to_time_delta(offline_threshold),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Device> {
        self.devices
            .iter()
            .map(|(id, device)| (id.clone(), device.clone()))
            .collect()
    }

    pub fn apply(&mut self, observation: &DeviceObservation) -> Applied {
        let Some(device) = self.devices.get_mut(&observation.device_id) else {
            let display_name = self.display_names.get(&observation.device_id).cloned();
            let device =
                Device::from_observation(observation, display_name, self.offline_threshold);
            self.devices.insert(observation.device_id.clone(), device);
            return Applied {
                verdict: Verdict::Created,
                confirmed: None,
            };
        };

        if let Err(rejection) = admit(device, observation) {
            return Applied {
                verdict: Verdict::Rejected(rejection),
                confirmed: None,
            };
        }

        let verdict = if observation.state != device.current_state {
            let previous = device.current_state;
            device.current_state = observation.state;
            device.last_state_change_at = observation.observed_at;
            Verdict::StateChanged { previous }
        } else {
            Verdict::Refreshed
        };

        device.last_observed_at = observation.observed_at;
        device.last_observed_source = observation.source;
        device.last_sequence = observation.sequence;
        device.onliness_deadline = deadline(observation.observed_at, self.offline_threshold);

        let confirmed = match &device.pending {
            Some(pending) if pending.is_confirmed_by(observation) => device.pending.take(),
            _ => None,
        };

        Applied { verdict, confirmed }
    }

    /// Records a best-effort display name. Names for devices that have not
    /// been observed yet are kept until their first observation.
    /// Returns true if a known device was renamed.
    pub fn annotate(&mut self, device_id: &str, display_name: &str) -> bool {
        self.display_names
            .insert(device_id.to_string(), display_name.to_string());

        match self.devices.get_mut(device_id) {
            Some(device) if device.display_name.as_deref() != Some(display_name) => {
                device.display_name = Some(display_name.to_string());
                true
            }
            _ => false,
        }
    }

    /// Sets the optimistic marker. Returns the marker it replaced.
    pub fn begin_pending(
        &mut self,
        device_id: &str,
        pending: PendingCommand,
    ) -> Result<Option<PendingCommand>, RegistryError> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        Ok(device.pending.replace(pending))
    }

    /// Clears the optimistic marker if it still belongs to `intent_id`.
    pub fn expire_pending(&mut self, device_id: &str, intent_id: u64) -> bool {
        match self.devices.get_mut(device_id) {
            Some(device)
                if device
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.intent_id == intent_id) =>
            {
                device.pending = None;
                true
            }
            _ => false,
        }
    }
}

fn admit(device: &Device, observation: &DeviceObservation) -> Result<(), Rejection> {
    match observation.observed_at.cmp(&device.last_observed_at) {
        Ordering::Greater => Ok(()),
        Ordering::Less => Err(Rejection::Stale {
            last_observed_at: device.last_observed_at,
        }),
        Ordering::Equal => {
            let holder = device.last_observed_source;
            match observation.source.priority().cmp(&holder.priority()) {
                Ordering::Greater => Ok(()),
                Ordering::Less => Err(Rejection::OutrankedBy { holder }),
                Ordering::Equal => match (observation.sequence, device.last_sequence) {
                    (Some(incoming), Some(last)) if incoming < last => {
                        Err(Rejection::OutOfSequence {
                            last_sequence: last,
                        })
                    }
                    _ => Ok(()),
                },
            }
        }
    }
}
