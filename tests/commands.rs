use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use relaydeck::command::{CommandConfig, CommandDispatcher, ControlChannel};
use relaydeck::config::AppConfig;
use relaydeck::error::{CommandError, TransportError};
use relaydeck::mqtt::{Connector, InboundFrame, Session, TransportCandidate};
use relaydeck::registry::{
    ChangeKind, DeviceObservation, RegistryConfig, RegistryHandle, Source, SwitchState,
};
use relaydeck::Monitor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Accepts every command and never answers.
#[derive(Default)]
struct SilentBoard {
    received: Mutex<Vec<(String, SwitchState)>>,
}

#[async_trait]
impl ControlChannel for SilentBoard {
    async fn deliver(&self, device_id: &str, state: SwitchState) -> Result<(), CommandError> {
        self.received
            .lock()
            .unwrap()
            .push((device_id.to_string(), state));
        Ok(())
    }
}

async fn registry_with_d1_off() -> RegistryHandle {
    let (registry, _task) =
        RegistryHandle::spawn(&RegistryConfig::default(), CancellationToken::new());
    registry
        .observe(DeviceObservation::new(
            "d1",
            SwitchState::Off,
            Utc::now() - TimeDelta::seconds(30),
            Source::Database,
        ))
        .await
        .unwrap();
    registry
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_command_reverts_after_timeout() {
    let registry = registry_with_d1_off().await;
    let board = Arc::new(SilentBoard::default());
    let dispatcher =
        CommandDispatcher::new(registry.clone(), board.clone(), &CommandConfig::default());
    let mut changes = registry.subscribe();

    let ticket = dispatcher.dispatch("d1", SwitchState::On).await.unwrap();
    let intent_id = ticket.intent_id();

    let pending = changes.recv().await.unwrap();
    assert_eq!(pending.kind, ChangeKind::CommandPending { intent_id });
    assert_eq!(pending.device.displayed_state(), SwitchState::On);
    assert_eq!(pending.device.current_state, SwitchState::Off);

    let started = tokio::time::Instant::now();
    let outcome = ticket.outcome().await;
    assert!(matches!(
        outcome,
        Err(CommandError::Timeout {
            requested: SwitchState::On,
            ..
        })
    ));
    assert!(started.elapsed() >= Duration::from_secs(10));

    let reverted = changes.recv().await.unwrap();
    assert_eq!(reverted.kind, ChangeKind::CommandReverted { intent_id });
    assert!(!reverted.device.is_pending());
    assert_eq!(reverted.device.displayed_state(), SwitchState::Off);
    assert_eq!(
        board.received.lock().unwrap().as_slice(),
        &[("d1".to_string(), SwitchState::On)]
    );
}

#[tokio::test]
async fn observation_from_any_source_confirms() {
    let registry = registry_with_d1_off().await;
    let dispatcher = CommandDispatcher::new(
        registry.clone(),
        Arc::new(SilentBoard::default()),
        &CommandConfig::default(),
    );

    let ticket = dispatcher.dispatch("d1", SwitchState::On).await.unwrap();
    registry
        .observe(DeviceObservation::new(
            "d1",
            SwitchState::On,
            Utc::now() + TimeDelta::seconds(1),
            Source::Http,
        ))
        .await
        .unwrap();

    let report = ticket.outcome().await.unwrap();
    assert_eq!(report.device_id, "d1");
    assert_eq!(report.requested_state, SwitchState::On);
    assert_eq!(report.confirmed_by, Source::Http);

    let device = registry.device("d1").unwrap();
    assert!(!device.is_pending());
    assert_eq!(device.current_state, SwitchState::On);
}

#[tokio::test]
async fn commands_for_unseen_devices_are_refused() {
    let registry = registry_with_d1_off().await;
    let board = Arc::new(SilentBoard::default());
    let dispatcher = CommandDispatcher::new(registry, board.clone(), &CommandConfig::default());

    let result = dispatcher.send("d9", SwitchState::On).await;
    assert_eq!(result.err(), Some(CommandError::UnknownDevice("d9".to_string())));
    assert!(board.received.lock().unwrap().is_empty());
}

/// Broker whose single session replays frames pushed by the test.
struct FeedBroker {
    feed: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
}

struct FeedSession {
    feed: mpsc::Receiver<InboundFrame>,
}

#[async_trait]
impl Connector for FeedBroker {
    type Session = FeedSession;

    async fn connect(
        &self,
        _candidate_index: usize,
        candidate: &TransportCandidate,
    ) -> Result<FeedSession, TransportError> {
        match self.feed.lock().unwrap().take() {
            Some(feed) => Ok(FeedSession { feed }),
            None => Err(TransportError::Refused {
                candidate: candidate.name(),
                reason: "feed already taken".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Session for FeedSession {
    fn label(&self) -> &str {
        "feed"
    }

    async fn subscribe(&mut self, _filter: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<InboundFrame, TransportError> {
        match self.feed.recv().await {
            Some(frame) => Ok(frame),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn monitor_routes_broker_frames_and_commands() {
    let (feed_tx, feed_rx) = mpsc::channel(8);
    let broker = FeedBroker {
        feed: Mutex::new(Some(feed_rx)),
    };
    let mut config = AppConfig::default();
    config.commands.confirm_timeout_ms = 2_000;

    let monitor = Monitor::start_with(&config, broker).unwrap();
    let mut snapshots = monitor.watch();

    feed_tx
        .send(InboundFrame::new("sinric/d1/status", "OFF"))
        .await
        .unwrap();
    feed_tx
        .send(InboundFrame::new("sinric/d1/bogus", "ON"))
        .await
        .unwrap();
    feed_tx
        .send(InboundFrame::new("sinric/d2/status", "ON"))
        .await
        .unwrap();

    let snapshot = snapshots
        .wait_for(|s| s.get("d1").is_some() && s.get("d2").is_some())
        .await
        .unwrap()
        .clone();
    let d1 = snapshot.get("d1").unwrap();
    assert_eq!(d1.current_state, SwitchState::Off);
    assert_eq!(d1.last_observed_source, Source::Mqtt);
    assert!(d1.is_online());
    assert_eq!(snapshot.get("d2").unwrap().current_state, SwitchState::On);
    assert!(monitor.negotiator_status().is_live());

    // No board address yet, so there is no route for commands.
    assert_eq!(monitor.device_target().current(), None);
    let result = monitor.send("d1", SwitchState::On).await;
    assert_eq!(result.err(), Some(CommandError::NoRoute("d1".to_string())));
    assert!(!monitor.registry().device("d1").unwrap().is_pending());

    feed_tx
        .send(InboundFrame::new("sinric/d1/ip", "127.0.0.1"))
        .await
        .unwrap();
    let mut target = monitor.device_target().watch();
    target.wait_for(Option::is_some).await.unwrap();
    assert_eq!(
        monitor.device_target().current().as_deref(),
        Some("http://127.0.0.1")
    );

    let health = monitor.adapter_health();
    assert_eq!(health[0].source, Source::Mqtt);
    assert!(health[0].available);
    assert!(!monitor.all_sources_unavailable());

    monitor.shutdown().await;
}
