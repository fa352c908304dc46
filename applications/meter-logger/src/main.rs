use chrono::Utc;
use meter_logger::accrual::{AccrualEngine, AccrualSettings};
use meter_logger::config::Config;
use meter_logger::mqtt::{self, RowPublisher};
use meter_logger::poller::{next_boundary_delay, Poller};
use meter_logger::retry::Retrying;
use meter_logger::sink::{self, BufferedSink, SqliteSink};
use meter_logger::source::{build_sources, modbus::ModbusRtuTransport};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        physical = cfg.meter.meters.len(),
        simulated = cfg.meter.simulated.len(),
        interval_secs = cfg.meter.interval_secs,
        "loaded config"
    );

    let pool = sink::connect(&cfg.storage.url).await?;
    let local = SqliteSink::new(pool);
    local.ensure_schema().await?;
    info!("local store ready");

    let mut engine = AccrualEngine::new(
        cfg.validation.clone(),
        AccrualSettings::new(cfg.meter.interval_secs, &cfg.accrual),
    );
    for (meter_id, state) in local.latest_states().await? {
        info!(
            meter_id = %meter_id,
            cumulative_energy_wh = state.cumulative_energy_wh,
            last = %state.last_timestamp,
            "resuming ledger"
        );
        engine.seed(meter_id, state);
    }
    let mut store = BufferedSink::new(local, cfg.storage.pending_capacity);

    let publisher = match &cfg.mqtt {
        Some(mcfg) => {
            let (client, eventloop) = mqtt::new(mqtt::build_options(mcfg));
            mqtt::spawn_event_loop(eventloop);
            info!(host = %mcfg.host, topic = %mcfg.topic, "relaying rows to MQTT");
            Some(RowPublisher::new(client, mcfg))
        }
        None => None,
    };

    let transport = Retrying::new(
        ModbusRtuTransport::new(cfg.meter.serial.clone(), &cfg.reconnect),
        cfg.retry.clone(),
    );
    let mut poller = Poller::new(
        transport,
        build_sources(&cfg.meter),
        engine,
        Duration::from_millis(cfg.meter.poll_timeout_ms),
    );

    let period = Duration::from_secs(cfg.meter.interval_secs);
    let mut ticker = interval_at(Instant::now() + next_boundary_delay(Utc::now(), period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let outcome = poller.poll_cycle(Utc::now()).await;
                if outcome.rows.is_empty() && store.pending() > 0 {
                    let _ = store.flush().await;
                }
                for row in outcome.rows {
                    if let Some(p) = &publisher {
                        if let Err(e) = p.publish(&row) {
                            warn!(meter_id = %row.reading.meter_id, error = %e, "relay failed");
                        }
                    }
                    // failures stay queued inside the store and are retried on the next write
                    let _ = store.write(row).await;
                }
            }
        }
    }

    if let Err(e) = store.flush().await {
        warn!(pending = store.pending(), error = %e, "rows left unwritten at shutdown");
    }
    if let Some(p) = &publisher {
        p.disconnect().await;
    }
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
