use color_eyre::Result;
use relaydeck::config::AppConfig;
use relaydeck::registry::handle::{ChangeKind, DeviceChange};
use relaydeck::Monitor;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup_errors()?;

    let path = AppConfig::config_path();
    let config = AppConfig::load_or_default(&path).await?;
    let level = config.logging.level();
    setup_logging(level.as_ref().copied().unwrap_or(Level::INFO));
    if let Err(e) = level {
        warn!("{}, using info", e);
    }
    info!("Using config {}", path.display());

    let monitor = Monitor::start(&config)?;
    let mut changes = monitor.subscribe();
    let mut negotiator = monitor.watch_negotiator();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupt received");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => log_change(&change),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} device changes", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = negotiator.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = negotiator.borrow_and_update().clone();
                debug!("Broker phase: {:?}", status.phase);
                if status.is_degraded() {
                    error!(
                        "Broker connection degraded after {} cycles: {}",
                        status.cycles_failed,
                        status
                            .last_failure
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default()
                    );
                }
                if monitor.all_sources_unavailable() {
                    warn!("No observation source is currently available");
                }
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

fn log_change(change: &DeviceChange) {
    let device = &change.device;
    let name = device.display_name.as_deref().unwrap_or(&device.device_id);
    match &change.kind {
        ChangeKind::Discovered => info!("{} discovered ({})", name, device.current_state),
        ChangeKind::StateChanged { previous } => {
            info!("{}: {} -> {}", name, previous, device.current_state)
        }
        ChangeKind::Observed => debug!("{} seen via {}", name, device.last_observed_source),
        ChangeKind::Renamed => info!("{} renamed", device.device_id),
        ChangeKind::CommandPending { intent_id } => {
            info!("{}: command {} pending", name, intent_id)
        }
        ChangeKind::CommandConfirmed { intent_id } => {
            info!("{}: command {} confirmed", name, intent_id)
        }
        ChangeKind::CommandReverted { intent_id } => {
            warn!("{}: command {} reverted", name, intent_id)
        }
    }
}

fn setup_errors() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
