//! # relaydeck
//!
//! Connectivity and state-reconciliation core for a dashboard of ESP32
//! relay boards.
//!
//! ```text
//! broker candidates ──► ConnectionNegotiator ──► TopicRouter ──┐
//! board HTTP API ─────► DeviceHttpSource (poller) ─────────────┼──► DeviceRegistry ──► snapshots / changes
//! event store ────────► DatabaseSource (poller) ───────────────┘          ▲
//!                                                                         │
//! user ──► CommandDispatcher ──► board /control ──► (next observation) ───┘
//! ```
//!
//! [`monitor::Monitor`] wires one instance of each and is what applications
//! hold on to.

pub mod command;
pub mod config;
pub mod error;
pub mod monitor;
pub mod mqtt;
pub mod registry;
pub mod sources;

pub use config::AppConfig;
pub use monitor::Monitor;
