use chrono::{DateTime, Utc};
use std::fmt;

const PREVIEW_LEN: usize = 24;

/// One inbound publish as handed over by the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_LEN).collect();
        let ellipsis = if text.chars().count() > PREVIEW_LEN {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} {} {:?}{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let frame = InboundFrame::new("sinric/d1/status", "x".repeat(100));
        let rendered = frame.to_string();
        assert!(rendered.contains("sinric/d1/status"));
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn display_handles_short_and_binary_payloads() {
        let frame = InboundFrame::new("sinric/d1/status", vec![0xff, b'O', b'N']);
        assert!(!frame.to_string().ends_with("..."));
        assert_eq!(frame.payload_str(), None);
    }
}
