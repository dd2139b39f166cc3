use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Wire protocol for one broker candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain MQTT over TCP (`mqtt://`)
    Tcp,
    /// MQTT over TLS (`mqtts://`)
    Tls,
    /// MQTT over WebSocket (`ws://`)
    Ws,
    /// MQTT over secure WebSocket (`wss://`)
    Wss,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "mqtt",
            Protocol::Tls => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }
}

/// One (protocol, port) combination to try against the broker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    pub protocol: Protocol,
    pub port: u16,
    /// Request path for websocket candidates, e.g. `/mqtt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TransportCandidate {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            port,
            path: None,
            label: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label used in logs and diagnostics.
    pub fn name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{}:{}", self.protocol.scheme(), self.port),
        }
    }

    /// Full broker URL for this candidate.
    pub fn broker_url(&self, host: &str) -> String {
        let path = if self.protocol.is_websocket() {
            let path = self.path.as_deref().unwrap_or("/mqtt");
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            }
        } else {
            String::new()
        };
        format!("{}://{}:{}{}", self.protocol.scheme(), host, self.port, path)
    }
}

impl fmt::Display for TransportCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Broker connection settings and the ordered candidate list.
///
/// The default candidate order was found by trial against a hosted broker;
/// it carries no protocol meaning and is meant to be reordered per
/// deployment.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// First topic segment(s), e.g. `sinric` for `sinric/<device>/status`.
    pub namespace: String,
    pub keep_alive_secs: u64,
    pub candidate_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// Consecutive exhausted cycles before reporting degraded.
    pub max_cycles: u32,
    pub candidates: Vec<TransportCandidate>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            username: None,
            password: None,
            client_id: "relaydeck".to_string(),
            namespace: "sinric".to_string(),
            keep_alive_secs: 60,
            candidate_timeout_ms: 12_000,
            retry_delay_ms: 5_000,
            max_cycles: 10,
            candidates: vec![
                TransportCandidate::new(Protocol::Wss, 8084).with_path("/mqtt"),
                TransportCandidate::new(Protocol::Tls, 8883),
                TransportCandidate::new(Protocol::Ws, 8083).with_path("/mqtt"),
                TransportCandidate::new(Protocol::Ws, 8080).with_path("/mqtt"),
            ],
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
