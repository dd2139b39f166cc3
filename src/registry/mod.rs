//! # Device Registry
//!
//! The reconciliation engine. Observations from every adapter land on one
//! ingress queue and are merged into one canonical [`Device`] per device id.
//!
//! ```text
//! MQTT listener ──┐
//! HTTP poller ────┼──► ingress (mpsc) ──► RegistryActor ──► watch<RegistrySnapshot>
//! DB poller ──────┘                           │
//!                                             └──────────► broadcast<DeviceChange>
//! ```
//!
//! - [`device`] - observation and device records
//! - [`reconcile`] - the acceptance rule and the device table
//! - [`handle`] - the single-writer actor and its handles
//!
//! Device records are created lazily on the first accepted observation and
//! never removed; staleness is expressed through the onliness deadline.

pub mod device;
pub mod handle;
pub mod reconcile;

pub use device::{Device, DeviceObservation, PendingCommand, Source, SwitchState};
pub use handle::{
    ChangeKind, DeviceChange, ObservationSink, RegistryConfig, RegistryHandle, RegistrySnapshot,
};
pub use reconcile::{DeviceTable, Rejection, Verdict};
