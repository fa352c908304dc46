use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meter_bridge::aggregate::WindowAggregator;
use meter_bridge::config::{Config, InputConfig, LocalDbConfig, MqttConfig};
use meter_bridge::db::{self, PgWindowStore};
use meter_bridge::ingest::{spawn_writer, Ingestor};
use meter_bridge::local_db::{resume_point, LocalDbTail};
use meter_bridge::mqtt;
use meter_bridge::window::WindowSpec;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often idle windows are checked for closing.
const IDLE_CHECK: Duration = Duration::from_secs(5);

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
        window_secs = cfg.window.size_secs,
        durable_input = cfg.input.is_durable(),
        "loaded config"
    );

    let pool = db::connect(&cfg.database.url).await?;
    let store = PgWindowStore::new(pool);
    store.ensure_schema().await?;
    let stored_ends = store.latest_window_ends().await?;
    info!(meters = stored_ends.len(), "connected to database");

    let spec = WindowSpec::new(ChronoDuration::seconds(cfg.window.size_secs as i64));
    let idle_close = cfg
        .window
        .idle_close_secs
        .map(|s| ChronoDuration::seconds(s as i64));
    let mut aggregator = WindowAggregator::new(spec, idle_close);
    for (meter_id, end) in &stored_ends {
        info!(meter_id = %meter_id, resume_at = %end, "resuming after stored windows");
        aggregator.resume_from(meter_id.clone(), *end);
    }
    for partial in store.partial_windows().await? {
        aggregator.reopen(partial);
    }

    let (tx, writer) = spawn_writer(store, cfg.database.write.clone());
    let mut ingestor = Ingestor::new(aggregator, tx);

    let shutdown = shutdown_signal();
    match &cfg.input {
        InputConfig::Mqtt(m) => run_mqtt(m, &mut ingestor, shutdown).await,
        InputConfig::LocalDb(l) => run_local_db(l, &stored_ends, &mut ingestor, shutdown).await?,
    }

    ingestor.finish(!cfg.input.is_durable()).await?;
    let unwritten = writer.await?;
    info!(unwritten, "stopped");
    Ok(())
}

async fn run_mqtt(cfg: &MqttConfig, ingestor: &mut Ingestor, shutdown: impl Future<Output = ()>) {
    let (client, eventloop) = mqtt::new(mqtt::build_options(cfg));
    let (mut payloads, _events) = mqtt::spawn_subscriber(client.clone(), eventloop, cfg);
    info!(host = %cfg.host, topic = %cfg.topic, "consuming rows from MQTT");

    let mut idle = tokio::time::interval(IDLE_CHECK);
    idle.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            msg = payloads.recv() => {
                let Some(payload) = msg else {
                    warn!("mqtt subscriber stopped");
                    break;
                };
                if let Err(e) = ingestor.handle_payload(&payload).await {
                    warn!(error = %e, "processing failed for incoming message");
                }
            }
            _ = idle.tick() => {
                if let Err(e) = ingestor.tick(Utc::now()).await {
                    warn!(error = %e, "idle window check failed");
                }
            }
        }
    }
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect: {e}");
    }
}

async fn run_local_db(
    cfg: &LocalDbConfig,
    stored_ends: &HashMap<String, DateTime<Utc>>,
    ingestor: &mut Ingestor,
    shutdown: impl Future<Output = ()>,
) -> Result<(), anyhow::Error> {
    let mut tail = LocalDbTail::open(&cfg.url, cfg.batch_size).await?;
    let meters = tail.meters().await?;
    match resume_point(&meters, stored_ends) {
        Some(ts) => {
            info!(from = %ts, "tailing local store");
            tail.start_at(ts);
        }
        None => info!("tailing local store from the beginning"),
    }

    let mut poll = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = poll.tick() => {
                // drain everything available before waiting for the next tick
                loop {
                    match tail.next_batch().await {
                        Ok(rows) if rows.is_empty() => break,
                        Ok(rows) => {
                            let full = rows.len() as u32 >= cfg.batch_size;
                            for row in rows {
                                ingestor.handle_row(row).await?;
                            }
                            if !full {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "reading local store failed");
                            break;
                        }
                    }
                }
                ingestor.tick(Utc::now()).await?;
            }
        }
    }
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
