//! Database backfill over the PostgREST API of the event store.
//!
//! The event table is append-only, one row per state report. Only the newest
//! row per device is turned into an observation; older rows would be
//! rejected by the registry anyway. Names from the optional custom device
//! table are passed along as display names.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{PollSource, SourcePoll};
use crate::error::{AdapterUnavailable, MalformedObservation};
use crate::registry::device::{DeviceObservation, Source, SwitchState};

// Unix timestamps above this are in milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub events_table: String,
    /// Table with `device_id` / `name` columns. Skipped when unset.
    pub devices_table: Option<String>,
    pub order_column: String,
    pub poll_interval_ms: u64,
    pub row_limit: u32,
    pub request_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            events_table: "events".to_string(),
            devices_table: Some("custom_devices".to_string()),
            order_column: "created_at".to_string(),
            poll_interval_ms: 30_000,
            row_limit: 200,
            request_timeout_ms: 10_000,
        }
    }
}

impl DatabaseConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url.trim_end_matches('/'), table)
    }
}

/// One row of the event table. Only the columns used here are decoded.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventRow {
    pub device_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub ts: Option<Value>,
}

impl EventRow {
    pub fn observed_at(&self) -> Result<DateTime<Utc>, MalformedObservation> {
        if let Some(created_at) = self.created_at.as_deref() {
            if let Some(parsed) = parse_timestamp(created_at) {
                return Ok(parsed);
            }
        }
        self.ts
            .as_ref()
            .and_then(unix_timestamp)
            .ok_or_else(|| MalformedObservation::MissingTimestamp(self.device_id.clone()))
    }

    pub fn to_observation(&self) -> Result<DeviceObservation, MalformedObservation> {
        let state: SwitchState = self
            .state
            .as_deref()
            .ok_or_else(|| MalformedObservation::State(String::new()))?
            .parse()?;
        Ok(DeviceObservation::new(
            self.device_id.clone(),
            state,
            self.observed_at()?,
            Source::Database,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceNameRow {
    device_id: String,
    #[serde(default)]
    name: Option<String>,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Postgres `timestamp without time zone` comes back without an offset.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn unix_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if raw.abs() > MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

/// Reduces rows to the newest valid observation per device, oldest first.
/// Rows that cannot be decoded are skipped.
pub fn latest_per_device(rows: &[EventRow]) -> Vec<DeviceObservation> {
    let mut latest: HashMap<&str, DeviceObservation> = HashMap::new();
    for row in rows {
        let observation = match row.to_observation() {
            Ok(observation) => observation,
            Err(e) => {
                debug!("Skipping event row: {}", e);
                continue;
            }
        };
        match latest.get(row.device_id.as_str()) {
            Some(existing) if existing.observed_at >= observation.observed_at => {}
            _ => {
                latest.insert(row.device_id.as_str(), observation);
            }
        }
    }

    let mut observations: Vec<_> = latest.into_values().collect();
    observations.sort_by(|a, b| {
        a.observed_at
            .cmp(&b.observed_at)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
    observations
}

pub struct DatabaseSource {
    http: reqwest::Client,
    config: DatabaseConfig,
}

impl DatabaseSource {
    pub fn new(config: DatabaseConfig) -> reqwest::Result<Self> {
        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            if let Ok(key) = HeaderValue::from_str(&config.api_key) {
                headers.insert("apikey", key);
            }
            if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", config.api_key)) {
                headers.insert(AUTHORIZATION, bearer);
            }
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self { http, config })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, AdapterUnavailable> {
        let response = self
            .http
            .get(self.config.rest_url(table))
            .query(query)
            .send()
            .await
            .map_err(|e| AdapterUnavailable::Request {
                adapter: Source::Database,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterUnavailable::Status {
                adapter: Source::Database,
                status: status.as_u16(),
            });
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| AdapterUnavailable::Decode {
                adapter: Source::Database,
                reason: e.to_string(),
            })
    }

    pub async fn fetch_events(&self) -> Result<Vec<EventRow>, AdapterUnavailable> {
        self.fetch(
            &self.config.events_table,
            &[
                ("select", "*".to_string()),
                ("order", format!("{}.desc", self.config.order_column)),
                ("limit", self.config.row_limit.to_string()),
            ],
        )
        .await
    }

    /// Display names, best effort: a missing table is not an outage.
    pub async fn fetch_display_names(&self) -> Vec<(String, String)> {
        let Some(table) = self.config.devices_table.as_deref() else {
            return Vec::new();
        };
        match self
            .fetch::<DeviceNameRow>(
                table,
                &[
                    ("select", "device_id,name".to_string()),
                    ("limit", self.config.row_limit.to_string()),
                ],
            )
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let name = row.name?.trim().to_string();
                    (!name.is_empty()).then_some((row.device_id, name))
                })
                .collect(),
            Err(e) => {
                debug!("Device names unavailable from {}: {}", table, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl PollSource for DatabaseSource {
    fn source(&self) -> Source {
        Source::Database
    }

    async fn poll(&self) -> Result<SourcePoll, AdapterUnavailable> {
        if self.config.url.trim().is_empty() {
            return Err(AdapterUnavailable::NoTarget {
                adapter: Source::Database,
            });
        }

        let rows = self.fetch_events().await?;
        let observations = latest_per_device(&rows);
        if observations.is_empty() && !rows.is_empty() {
            warn!("None of {} event rows could be decoded", rows.len());
        }

        Ok(SourcePoll {
            observations,
            display_names: self.fetch_display_names().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_http::CannedServer;

    fn row(device_id: &str, state: &str, created_at: Option<&str>, ts: Option<Value>) -> EventRow {
        EventRow {
            device_id: device_id.to_string(),
            state: Some(state.to_string()),
            created_at: created_at.map(str::to_string),
            ts,
        }
    }

    #[test]
    fn timestamps_from_either_column() {
        let rfc = row("d1", "ON", Some("2024-05-01T10:00:00.250+00:00"), None);
        assert_eq!(
            rfc.observed_at().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::TimeDelta::milliseconds(250)
        );

        let naive = row("d1", "ON", Some("2024-05-01 10:00:00"), None);
        assert_eq!(
            naive.observed_at().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );

        let seconds = row("d1", "ON", None, Some(Value::from(1_714_557_600i64)));
        let millis = row("d1", "ON", None, Some(Value::from(1_714_557_600_000i64)));
        let text = row("d1", "ON", None, Some(Value::from("1714557600")));
        assert_eq!(seconds.observed_at().unwrap(), millis.observed_at().unwrap());
        assert_eq!(seconds.observed_at().unwrap(), text.observed_at().unwrap());
    }

    #[test]
    fn rows_without_timestamp_or_state_are_skipped() {
        let rows = vec![
            row("d1", "ON", None, None),
            row("d2", "MAYBE", Some("2024-05-01T10:00:00Z"), None),
            EventRow {
                device_id: "d3".to_string(),
                state: None,
                created_at: Some("2024-05-01T10:00:00Z".to_string()),
                ts: None,
            },
            row("d4", "off", Some("2024-05-01T10:00:00Z"), None),
        ];

        let observations = latest_per_device(&rows);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].device_id, "d4");
        assert_eq!(observations[0].state, SwitchState::Off);
        assert_eq!(observations[0].source, Source::Database);
    }

    #[test]
    fn newest_row_wins_per_device() {
        let rows = vec![
            row("d1", "ON", Some("2024-05-01T10:00:05Z"), None),
            row("d2", "OFF", Some("2024-05-01T10:00:01Z"), None),
            row("d1", "OFF", Some("2024-05-01T10:00:00Z"), None),
            row("d1", "OFF", Some("2024-05-01T10:00:09Z"), None),
        ];

        let observations = latest_per_device(&rows);
        let summary: Vec<_> = observations
            .iter()
            .map(|o| (o.device_id.as_str(), o.state))
            .collect();
        assert_eq!(summary, vec![("d2", SwitchState::Off), ("d1", SwitchState::Off)]);
    }

    #[tokio::test]
    async fn poll_sends_credentials_and_decodes_rows() {
        let server = CannedServer::start(
            200,
            r#"[{"id":7,"device_id":"d1","state":"ON","created_at":"2024-05-01T10:00:00+00:00"}]"#,
        )
        .await;
        let source = DatabaseSource::new(DatabaseConfig {
            enabled: true,
            url: format!("{}/", server.base_url),
            api_key: "anon-key".to_string(),
            devices_table: None,
            ..DatabaseConfig::default()
        })
        .unwrap();

        let poll = source.poll().await.unwrap();
        assert_eq!(poll.observations.len(), 1);
        assert_eq!(poll.observations[0].state, SwitchState::On);

        let request = server.requests().remove(0);
        assert!(request.starts_with("GET /rest/v1/events?select=*&order=created_at.desc&limit=200"));
        assert!(request.contains("apikey: anon-key"));
        assert!(request.to_lowercase().contains("authorization: bearer anon-key"));
    }

    #[tokio::test]
    async fn error_status_is_unavailable() {
        let server = CannedServer::start(503, r#"{"message":"down"}"#).await;
        let source = DatabaseSource::new(DatabaseConfig {
            enabled: true,
            url: server.base_url.clone(),
            ..DatabaseConfig::default()
        })
        .unwrap();

        assert_eq!(
            source.poll().await,
            Err(AdapterUnavailable::Status {
                adapter: Source::Database,
                status: 503
            })
        );
    }

    #[tokio::test]
    async fn missing_url_is_unavailable() {
        let source = DatabaseSource::new(DatabaseConfig::default()).unwrap();
        assert!(matches!(
            source.poll().await,
            Err(AdapterUnavailable::NoTarget { .. })
        ));
    }
}
