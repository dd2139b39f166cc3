//! # MQTT Integration Module
//!
//! Broker connectivity for the relay boards. The broker is status-only: the
//! boards publish their switch state and their HTTP address, nothing is ever
//! published back.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - broker settings and the ordered candidate list
//! ├── probe.rs         - one candidate, one attempt (rumqttc)
//! ├── negotiator.rs    - cycles, timeouts, degraded state, session supervision
//! ├── frame.rs         - inbound publish record
//! └── topic_router.rs  - topic/payload decoding
//! ```
//!
//! Exactly one [`negotiator::ConnectionNegotiator`] runs per process. It owns
//! the live session; everything downstream only sees [`frame::InboundFrame`]s.

pub mod config;
pub mod frame;
pub mod negotiator;
pub mod probe;
pub mod topic_router;

pub use config::{BrokerConfig, Protocol, TransportCandidate};
pub use frame::InboundFrame;
pub use negotiator::{
    AttemptStatus, ConnectionNegotiator, ConnectionState, NegotiatorHandle, NegotiatorSettings,
    NegotiatorStatus, Phase,
};
pub use probe::{Connector, MqttConnector, MqttSession, Session};
pub use topic_router::{IpAnnouncement, Routed, TopicRouter};
