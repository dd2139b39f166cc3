//! HTTP API of the relay board: `GET /status` for polling and
//! `POST /control` for commands.
//!
//! The board's address is not fixed. It starts from the configured base URL
//! and follows the IP announcements the board publishes over MQTT.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{PollSource, SourcePoll};
use crate::command::dispatcher::ControlChannel;
use crate::error::{AdapterUnavailable, CommandError};
use crate::registry::device::{DeviceObservation, Source, SwitchState};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceHttpConfig {
    /// e.g. `http://192.168.1.50`. Learned from IP announcements when unset.
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub control_timeout_ms: u64,
}

impl Default for DeviceHttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 10_000,
            request_timeout_ms: 5_000,
            control_timeout_ms: 10_000,
        }
    }
}

impl DeviceHttpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// Shared, retargetable base URL of the board.
#[derive(Clone)]
pub struct DeviceTarget {
    url: Arc<watch::Sender<Option<String>>>,
}

impl DeviceTarget {
    pub fn new(initial: Option<String>) -> Self {
        let initial = initial.and_then(|url| normalize(&url));
        let (url, _) = watch::channel(initial);
        Self { url: Arc::new(url) }
    }

    pub fn current(&self) -> Option<String> {
        self.url.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.url.subscribe()
    }

    /// Points the adapter at `http://<address>`. Returns true if the target
    /// changed.
    pub fn retarget(&self, address: Ipv4Addr) -> bool {
        let url = format!("http://{}", address);
        let changed = self.url.send_if_modified(|current| {
            if current.as_deref() == Some(url.as_str()) {
                false
            } else {
                *current = Some(url.clone());
                true
            }
        });
        if changed {
            info!("Device HTTP target is now {}", url);
        }
        changed
    }
}

fn normalize(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    (!url.is_empty()).then(|| url.to_string())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default)]
    pub devices: Vec<DeviceStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    #[serde(default)]
    pub gpio: Option<u32>,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest<'a> {
    device_id: &'a str,
    state: SwitchState,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct DeviceHttpClient {
    http: reqwest::Client,
    target: DeviceTarget,
    request_timeout: Duration,
    control_timeout: Duration,
}

impl DeviceHttpClient {
    pub fn new(config: &DeviceHttpConfig, target: DeviceTarget) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            target,
            request_timeout: config.request_timeout(),
            control_timeout: config.control_timeout(),
        })
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    fn base_url(&self) -> Result<String, AdapterUnavailable> {
        self.target.current().ok_or(AdapterUnavailable::NoTarget {
            adapter: Source::Http,
        })
    }

    pub async fn fetch_status(&self) -> Result<Vec<DeviceStatus>, AdapterUnavailable> {
        let url = format!("{}/status", self.base_url()?);
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(request_failed)?;

        let body: StatusResponse = decode(response).await?;
        if !body.success {
            return Err(AdapterUnavailable::Rejected {
                adapter: Source::Http,
                reason: body.message.unwrap_or_else(|| "success: false".to_string()),
            });
        }
        Ok(body.devices)
    }

    pub async fn control(
        &self,
        device_id: &str,
        state: SwitchState,
    ) -> Result<ControlResponse, AdapterUnavailable> {
        let url = format!("{}/control", self.base_url()?);
        debug!("POST {} {} -> {}", url, device_id, state);
        let response = self
            .http
            .post(&url)
            .timeout(self.control_timeout)
            .json(&ControlRequest { device_id, state })
            .send()
            .await
            .map_err(request_failed)?;

        let body: ControlResponse = decode(response).await?;
        if !body.success {
            return Err(AdapterUnavailable::Rejected {
                adapter: Source::Http,
                reason: body
                    .message
                    .unwrap_or_else(|| "success: false".to_string()),
            });
        }
        Ok(body)
    }
}

fn request_failed(e: reqwest::Error) -> AdapterUnavailable {
    let reason = if e.is_timeout() {
        "timed out".to_string()
    } else {
        e.to_string()
    };
    AdapterUnavailable::Request {
        adapter: Source::Http,
        reason,
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AdapterUnavailable> {
    let status = response.status();
    if !status.is_success() {
        return Err(AdapterUnavailable::Status {
            adapter: Source::Http,
            status: status.as_u16(),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| AdapterUnavailable::Decode {
            adapter: Source::Http,
            reason: e.to_string(),
        })
}

#[async_trait]
impl ControlChannel for DeviceHttpClient {
    async fn deliver(&self, device_id: &str, state: SwitchState) -> Result<(), CommandError> {
        match self.control(device_id, state).await {
            Ok(_) => Ok(()),
            Err(AdapterUnavailable::NoTarget { .. }) => {
                Err(CommandError::NoRoute(device_id.to_string()))
            }
            Err(e) => Err(CommandError::Delivery {
                device_id: device_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Polls the board's status endpoint.
pub struct DeviceHttpSource {
    client: DeviceHttpClient,
}

impl DeviceHttpSource {
    pub fn new(client: DeviceHttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PollSource for DeviceHttpSource {
    fn source(&self) -> Source {
        Source::Http
    }

    async fn poll(&self) -> Result<SourcePoll, AdapterUnavailable> {
        let devices = self.client.fetch_status().await?;
        let observed_at = Utc::now();

        let observations = devices
            .into_iter()
            .filter_map(|device| match device.state.parse::<SwitchState>() {
                Ok(state) => Some(DeviceObservation::new(
                    device.device_id,
                    state,
                    observed_at,
                    Source::Http,
                )),
                Err(e) => {
                    warn!("Board reported {} for {}", e, device.device_id);
                    None
                }
            })
            .collect();

        Ok(SourcePoll {
            observations,
            display_names: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_http::CannedServer;

    fn client_for(base_url: Option<String>) -> DeviceHttpClient {
        DeviceHttpClient::new(&DeviceHttpConfig::default(), DeviceTarget::new(base_url)).unwrap()
    }

    #[test]
    fn retarget_reports_changes_only() {
        let target = DeviceTarget::new(Some("http://10.0.0.1/".to_string()));
        assert_eq!(target.current().as_deref(), Some("http://10.0.0.1"));

        assert!(!target.retarget(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(target.retarget(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(target.current().as_deref(), Some("http://10.0.0.2"));

        assert_eq!(DeviceTarget::new(Some("  ".to_string())).current(), None);
    }

    #[tokio::test]
    async fn status_poll_yields_http_observations() {
        let server = CannedServer::start(
            200,
            r#"{"success":true,"devices":[{"deviceId":"d1","gpio":4,"state":"ON"},{"deviceId":"d2","gpio":5,"state":"BROKEN"}]}"#,
        )
        .await;
        let source = DeviceHttpSource::new(client_for(Some(server.base_url.clone())));

        let poll = source.poll().await.unwrap();
        assert_eq!(poll.observations.len(), 1);
        assert_eq!(poll.observations[0].device_id, "d1");
        assert_eq!(poll.observations[0].state, SwitchState::On);
        assert_eq!(poll.observations[0].source, Source::Http);
        assert!(server.requests()[0].starts_with("GET /status "));
    }

    #[tokio::test]
    async fn unsuccessful_and_non_2xx_are_unavailable() {
        let server = CannedServer::start(200, r#"{"success":false,"message":"busy"}"#).await;
        let source = DeviceHttpSource::new(client_for(Some(server.base_url.clone())));
        assert_eq!(
            source.poll().await,
            Err(AdapterUnavailable::Rejected {
                adapter: Source::Http,
                reason: "busy".to_string()
            })
        );

        let server = CannedServer::start(500, "{}").await;
        let source = DeviceHttpSource::new(client_for(Some(server.base_url.clone())));
        assert_eq!(
            source.poll().await,
            Err(AdapterUnavailable::Status {
                adapter: Source::Http,
                status: 500
            })
        );
    }

    #[tokio::test]
    async fn no_target_means_no_route() {
        let client = client_for(None);
        assert!(matches!(
            DeviceHttpSource::new(client.clone()).poll().await,
            Err(AdapterUnavailable::NoTarget { .. })
        ));
        assert_eq!(
            client.deliver("d1", SwitchState::On).await,
            Err(CommandError::NoRoute("d1".to_string()))
        );
    }

    #[tokio::test]
    async fn control_posts_camel_case_body() {
        let server = CannedServer::start(200, r#"{"success":true,"message":"ok"}"#).await;
        let client = client_for(Some(server.base_url.clone()));

        client.deliver("d1", SwitchState::Off).await.unwrap();

        let request = server.requests().remove(0);
        assert!(request.starts_with("POST /control "));
        assert!(request.ends_with(r#"{"deviceId":"d1","state":"OFF"}"#));
    }

    #[tokio::test]
    async fn rejected_control_is_delivery_failure() {
        let server = CannedServer::start(200, r#"{"success":false,"message":"relay stuck"}"#).await;
        let client = client_for(Some(server.base_url.clone()));

        let err = client.deliver("d1", SwitchState::On).await.unwrap_err();
        assert!(matches!(err, CommandError::Delivery { ref reason, .. } if reason.contains("relay stuck")));
    }
}
