//! Transport probe: one broker candidate, one attempt.
//!
//! The [`Connector`] trait is the seam between negotiation policy and the
//! real network. [`MqttConnector`] is the rumqttc-backed implementation;
//! tests plug in scripted fakes.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::config::{BrokerConfig, Protocol, TransportCandidate};
use super::frame::InboundFrame;
use crate::error::TransportError;

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Opens a session for one candidate. Must resolve only once the broker has
/// acknowledged the connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(
        &self,
        candidate_index: usize,
        candidate: &TransportCandidate,
    ) -> Result<Self::Session, TransportError>;
}

/// A live broker session.
#[async_trait]
pub trait Session: Send + 'static {
    fn label(&self) -> &str;

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Waits for the next inbound publish. An error means the session is
    /// gone and must be closed.
    async fn next_frame(&mut self) -> Result<InboundFrame, TransportError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    username: Option<String>,
    password: Option<String>,
    client_id: String,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive().max(MIN_KEEP_ALIVE),
        }
    }

    fn options(&self, candidate: &TransportCandidate) -> Result<MqttOptions, TransportError> {
        let label = candidate.name();
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidCandidate {
                candidate: label,
                reason: "broker host is empty".to_string(),
            });
        }
        if candidate.port == 0 {
            return Err(TransportError::InvalidCandidate {
                candidate: label,
                reason: "port 0".to_string(),
            });
        }

        // rumqttc expects the full URL as host for websocket transports
        let host = if candidate.protocol.is_websocket() {
            candidate.broker_url(&self.host)
        } else {
            self.host.clone()
        };

        let mut options = MqttOptions::new(self.client_id.clone(), host, candidate.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }

        let transport = match candidate.protocol {
            Protocol::Tcp => Transport::Tcp,
            Protocol::Tls => Transport::tls_with_default_config(),
            Protocol::Ws => Transport::Ws,
            Protocol::Wss => Transport::wss_with_default_config(),
        };
        options.set_transport(transport);
        Ok(options)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(
        &self,
        candidate_index: usize,
        candidate: &TransportCandidate,
    ) -> Result<MqttSession, TransportError> {
        let label = candidate.name();
        let options = self.options(candidate)?;
        info!(
            "Probing candidate {} ({})",
            candidate_index,
            candidate.broker_url(&self.host)
        );

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        debug!("{} acknowledged (session present: {})", label, ack.session_present);
                        return Ok(MqttSession {
                            client,
                            eventloop,
                            label,
                            unacked: VecDeque::new(),
                        });
                    }
                    return Err(TransportError::Refused {
                        candidate: label,
                        reason: format!("{:?}", ack.code),
                    });
                }
                Ok(event) => trace!("{} pre-connack event: {:?}", label, event),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::Refused {
                        candidate: label,
                        reason: format!("{:?}", code),
                    });
                }
                Err(e) => {
                    return Err(TransportError::Connection {
                        candidate: label,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    label: String,
    // Filters awaiting a SubAck, in request order.
    unacked: VecDeque<String>,
}

#[async_trait]
impl Session for MqttSession {
    fn label(&self) -> &str {
        &self.label
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SessionLost {
                candidate: self.label.clone(),
                reason: e.to_string(),
            })?;
        self.unacked.push_back(filter.to_string());
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<InboundFrame, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundFrame::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let filter = self.unacked.pop_front().unwrap_or_default();
                    check_suback(&self.label, &filter, &ack.return_codes)?;
                    debug!("{} subscribed to {}", self.label, filter);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(TransportError::SessionLost {
                        candidate: self.label.clone(),
                        reason: "broker sent disconnect".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(TransportError::SessionLost {
                        candidate: self.label.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("{} disconnect request failed: {}", self.label, e);
            return;
        }
        // Drive the loop so the DISCONNECT packet actually goes out.
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            warn!("{} did not flush disconnect in time", self.label);
        }
        info!("Closed broker session {}", self.label);
    }
}

/// A subscription the broker refused leaves the session useless, so it is
/// reported as a lost session.
fn check_suback(
    label: &str,
    filter: &str,
    codes: &[SubscribeReasonCode],
) -> Result<(), TransportError> {
    if codes.contains(&SubscribeReasonCode::Failure) {
        warn!("{} refused subscription to {}", label, filter);
        return Err(TransportError::SessionLost {
            candidate: label.to_string(),
            reason: format!("broker rejected subscription to {}", filter),
        });
    }
    Ok(())
}
