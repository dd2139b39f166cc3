use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

use super::frame::InboundFrame;
use crate::error::MalformedObservation;
use crate::registry::device::{DeviceObservation, Source, SwitchState};

const STATUS_KIND: &str = "status";
const IP_KIND: &str = "ip";

/// A device announcing the address of its HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAnnouncement {
    pub device_id: String,
    pub address: Ipv4Addr,
    pub announced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Observation(DeviceObservation),
    Announcement(IpAnnouncement),
}

/// Decodes `<namespace>/<device>/<kind>` frames.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    namespace: String,
}

impl TopicRouter {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: namespace.trim_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wildcard filters to subscribe on every fresh session.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/+/{}", self.namespace, STATUS_KIND),
            format!("{}/+/{}", self.namespace, IP_KIND),
        ]
    }

    pub fn route(&self, frame: &InboundFrame) -> Result<Routed, MalformedObservation> {
        let (device_id, kind) = self.split_topic(&frame.topic)?;

        let payload = frame
            .payload_str()
            .ok_or_else(|| MalformedObservation::Encoding(frame.topic.clone()))?
            .trim();

        match kind {
            STATUS_KIND => {
                let state = SwitchState::from_token(payload).ok_or_else(|| {
                    MalformedObservation::StatePayload {
                        topic: frame.topic.clone(),
                        payload: payload.to_string(),
                    }
                })?;
                Ok(Routed::Observation(DeviceObservation::new(
                    device_id,
                    state,
                    frame.received_at,
                    Source::Mqtt,
                )))
            }
            IP_KIND => {
                let address: Ipv4Addr =
                    payload
                        .parse()
                        .map_err(|_| MalformedObservation::AddressPayload {
                            topic: frame.topic.clone(),
                            payload: payload.to_string(),
                        })?;
                Ok(Routed::Announcement(IpAnnouncement {
                    device_id: device_id.to_string(),
                    address,
                    announced_at: frame.received_at,
                }))
            }
            other => Err(MalformedObservation::Kind {
                topic: frame.topic.clone(),
                kind: other.to_string(),
            }),
        }
    }

    fn split_topic<'a>(&self, topic: &'a str) -> Result<(&'a str, &'a str), MalformedObservation> {
        let malformed = || MalformedObservation::Topic(topic.to_string());

        let rest = topic
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;

        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device_id), Some(kind), None) if !device_id.is_empty() && !kind.is_empty() => {
                Ok((device_id, kind))
            }
            _ => Err(malformed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TopicRouter {
        TopicRouter::new("sinric")
    }

    #[test]
    fn subscriptions_cover_status_and_ip() {
        assert_eq!(
            router().subscriptions(),
            vec!["sinric/+/status".to_string(), "sinric/+/ip".to_string()]
        );
        assert_eq!(
            TopicRouter::new("/home/relays/").subscriptions()[0],
            "home/relays/+/status"
        );
    }

    #[test]
    fn status_frame_becomes_mqtt_observation() {
        let frame = InboundFrame::new("sinric/relay-1/status", " ON\n");
        let Routed::Observation(observation) = router().route(&frame).unwrap() else {
            panic!("expected observation");
        };
        assert_eq!(observation.device_id, "relay-1");
        assert_eq!(observation.state, SwitchState::On);
        assert_eq!(observation.source, Source::Mqtt);
        assert_eq!(observation.observed_at, frame.received_at);
    }

    #[test]
    fn ip_frame_becomes_announcement() {
        let frame = InboundFrame::new("sinric/relay-1/ip", "192.168.1.42");
        assert_eq!(
            router().route(&frame).unwrap(),
            Routed::Announcement(IpAnnouncement {
                device_id: "relay-1".to_string(),
                address: Ipv4Addr::new(192, 168, 1, 42),
                announced_at: frame.received_at,
            })
        );
    }

    #[test]
    fn malformed_topics_are_rejected() {
        for topic in [
            "other/relay-1/status",
            "sinric/relay-1",
            "sinric//status",
            "sinric/relay-1/status/extra",
            "sinricx/relay-1/status",
        ] {
            let frame = InboundFrame::new(topic, "ON");
            assert_eq!(
                router().route(&frame),
                Err(MalformedObservation::Topic(topic.to_string())),
                "{}",
                topic
            );
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let frame = InboundFrame::new("sinric/relay-1/power", "ON");
        assert!(matches!(
            router().route(&frame),
            Err(MalformedObservation::Kind { .. })
        ));
    }

    #[test]
    fn payloads_are_not_guessed() {
        for payload in ["on", "1", "{\"state\":\"ON\"}", ""] {
            let frame = InboundFrame::new("sinric/relay-1/status", payload);
            assert!(matches!(
                router().route(&frame),
                Err(MalformedObservation::StatePayload { .. })
            ));
        }

        let frame = InboundFrame::new("sinric/relay-1/ip", "relay.local");
        assert!(matches!(
            router().route(&frame),
            Err(MalformedObservation::AddressPayload { .. })
        ));

        let frame = InboundFrame::new("sinric/relay-1/status", vec![0xff, 0xfe]);
        assert!(matches!(
            router().route(&frame),
            Err(MalformedObservation::Encoding(_))
        ));
    }
}
