use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use relaydeck::error::RegistryError;
use relaydeck::registry::{
    ChangeKind, DeviceObservation, DeviceTable, RegistryConfig, RegistryHandle, Source,
    SwitchState, Verdict,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(offset_secs)
}

fn obs(state: SwitchState, offset_secs: i64, source: Source) -> DeviceObservation {
    DeviceObservation::new("d1", state, at(offset_secs), source)
}

fn table() -> DeviceTable {
    DeviceTable::new(Duration::from_secs(120))
}

#[test]
fn increasing_observations_converge_to_latest_regardless_of_source() {
    let sources = [Source::Database, Source::Mqtt, Source::Http];
    let states = [SwitchState::On, SwitchState::Off];

    // Every interleaving of sources over a fixed timeline ends at the last state.
    for rotation in 0..sources.len() {
        let mut table = table();
        let mut last = None;
        for step in 0..12 {
            let source = sources[(step + rotation) % sources.len()];
            let state = states[(step * 7 + rotation) % 2];
            let verdict = table.apply(&obs(state, step as i64, source)).verdict;
            assert!(verdict.is_accepted(), "step {} rejected: {:?}", step, verdict);
            last = Some(state);
        }
        assert_eq!(table.get("d1").unwrap().current_state, last.unwrap());
    }
}

#[test]
fn equal_timestamps_prefer_mqtt_then_http_then_database() {
    let orders = [
        [Source::Database, Source::Http, Source::Mqtt],
        [Source::Mqtt, Source::Database, Source::Http],
        [Source::Http, Source::Mqtt, Source::Database],
        [Source::Mqtt, Source::Http, Source::Database],
    ];

    for order in orders {
        let mut table = table();
        for source in order {
            let state = match source {
                Source::Mqtt => SwitchState::On,
                _ => SwitchState::Off,
            };
            table.apply(&obs(state, 0, source));
        }
        let device = table.get("d1").unwrap();
        assert_eq!(device.last_observed_source, Source::Mqtt, "{:?}", order);
        assert_eq!(device.current_state, SwitchState::On, "{:?}", order);
    }

    let mut table = table();
    table.apply(&obs(SwitchState::Off, 0, Source::Database));
    table.apply(&obs(SwitchState::On, 0, Source::Http));
    assert_eq!(table.get("d1").unwrap().last_observed_source, Source::Http);
}

#[test]
fn older_observations_never_regress() {
    let mut table = table();
    table.apply(&obs(SwitchState::Off, 0, Source::Database));
    table.apply(&obs(SwitchState::On, 10, Source::Database));
    let before = table.get("d1").unwrap().clone();

    for source in [Source::Mqtt, Source::Http, Source::Database] {
        let applied = table.apply(&obs(SwitchState::Off, 9, source));
        assert!(matches!(applied.verdict, Verdict::Rejected(_)));
    }

    let after = table.get("d1").unwrap();
    assert_eq!(after.current_state, before.current_state);
    assert_eq!(after.last_state_change_at, before.last_state_change_at);
    assert_eq!(after.last_observed_at, before.last_observed_at);
}

#[test]
fn state_change_time_moves_only_on_value_change() {
    let mut table = table();
    let timeline = [
        (SwitchState::Off, 0, true),
        (SwitchState::Off, 5, false),
        (SwitchState::On, 10, true),
        (SwitchState::On, 15, false),
        (SwitchState::On, 20, false),
        (SwitchState::Off, 25, true),
    ];

    let mut last_change = None;
    for (state, offset, changes) in timeline {
        table.apply(&obs(state, offset, Source::Mqtt));
        let device = table.get("d1").unwrap();
        if changes {
            assert_eq!(device.last_state_change_at, at(offset));
            last_change = Some(at(offset));
        } else {
            assert_eq!(Some(device.last_state_change_at), last_change);
        }
        assert_eq!(device.last_observed_at, at(offset));
    }
}

#[test]
fn device_exists_only_after_an_accepted_observation() {
    let mut table = table();
    assert!(table.is_empty());
    assert!(!table.annotate("d1", "Porch"));
    assert!(table.get("d1").is_none());

    table.apply(&obs(SwitchState::On, 0, Source::Http));
    let device = table.get("d1").unwrap();
    assert_eq!(device.display_name.as_deref(), Some("Porch"));
    assert_eq!(device.last_state_change_at, at(0));
    assert_eq!(device.last_observed_at, at(0));
    assert_eq!(device.last_observed_source, Source::Http);
}

#[test]
fn onliness_is_derived_from_last_observation() {
    let mut table = table();
    table.apply(&obs(SwitchState::On, 0, Source::Mqtt));
    let device = table.get("d1").unwrap();

    assert!(device.is_online_at(at(119)));
    assert!(!device.is_online_at(at(120)));

    table.apply(&obs(SwitchState::On, 100, Source::Database));
    assert!(table.get("d1").unwrap().is_online_at(at(200)));
}

#[tokio::test]
async fn stale_backfill_then_fresh_push() {
    let cancel = CancellationToken::new();
    let (registry, _task) = RegistryHandle::spawn(&RegistryConfig::default(), cancel.clone());
    let mqtt = registry.sink(Source::Mqtt, cancel.clone());
    let database = registry.sink(Source::Database, cancel.clone());
    let mut changes = registry.subscribe();

    mqtt.submit(obs(SwitchState::Off, 0, Source::Mqtt))
        .await
        .unwrap();
    assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Discovered);

    database
        .submit(obs(SwitchState::On, -10, Source::Database))
        .await
        .unwrap();
    mqtt.submit(obs(SwitchState::On, 5, Source::Mqtt))
        .await
        .unwrap();

    // The stale row produces no change; the next change is the push.
    let change = changes.recv().await.unwrap();
    assert_eq!(
        change.kind,
        ChangeKind::StateChanged {
            previous: SwitchState::Off
        }
    );
    assert_eq!(change.device.current_state, SwitchState::On);
    assert_eq!(change.device.last_state_change_at, at(5));
    assert_eq!(change.device.last_observed_source, Source::Mqtt);
}

#[tokio::test]
async fn stopped_adapter_cannot_write() {
    let registry_cancel = CancellationToken::new();
    let (registry, _task) =
        RegistryHandle::spawn(&RegistryConfig::default(), registry_cancel.clone());
    let adapter_cancel = CancellationToken::new();
    let sink = registry.sink(Source::Http, adapter_cancel.clone());

    sink.submit(obs(SwitchState::Off, 0, Source::Http))
        .await
        .unwrap();
    adapter_cancel.cancel();

    assert!(sink.is_closed());
    assert_eq!(
        sink.submit(obs(SwitchState::On, 1, Source::Http)).await,
        Err(RegistryError::Closed)
    );

    let mut snapshots = registry.watch();
    let snapshot = snapshots
        .wait_for(|s| s.get("d1").is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.get("d1").unwrap().current_state, SwitchState::Off);
}
