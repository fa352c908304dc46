use chrono::{DateTime, TimeZone, Utc};
use meter_bridge::local_db::LocalDbTail;
use meter_bridge::row::LoggedRow as BridgeRow;
use meter_logger::reading::{LoggedRow, Reading};
use meter_logger::sink::{connect, LocalSink, SqliteSink};
use pretty_assertions::assert_eq;

fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn logged(meter: &str, ms: i64, interval: f64, cumulative: f64) -> LoggedRow {
    LoggedRow {
        reading: Reading {
            timestamp: at_ms(ms),
            meter_id: meter.into(),
            voltage_v: 230.0,
            current_a: 1.5,
            active_power_w: 345.0,
            power_factor: 1.0,
            frequency_hz: 50.0,
            energy_register_kwh: Some(12.5),
        },
        energy_wh_interval: interval,
        cumulative_energy_wh: cumulative,
    }
}

async fn store_with(rows: &[LoggedRow]) -> SqliteSink {
    let sink = SqliteSink::new(connect("sqlite::memory:").await.unwrap());
    sink.ensure_schema().await.unwrap();
    for row in rows {
        sink.append(row).await.unwrap();
    }
    sink
}

fn keys(rows: &[BridgeRow]) -> Vec<(i64, String)> {
    rows.iter()
        .map(|r| (r.timestamp.timestamp_millis(), r.meter_id.clone()))
        .collect()
}

#[tokio::test]
async fn test_tail_reads_logger_rows_in_batches() {
    let sink = store_with(&[
        logged("1", 5_000, 0.5, 0.5),
        logged("1", 0, 0.0, 0.0),
        logged("1", 10_000, 0.5, 1.0),
        logged("1", 15_000, 0.5, 1.5),
        logged("1", 20_000, 0.5, 2.0),
    ])
    .await;
    let mut tail = LocalDbTail::from_pool(sink.pool().clone(), 2);

    // insertion order, not timestamp order
    let first = tail.next_batch().await.unwrap();
    assert_eq!(keys(&first), vec![(5_000, "1".into()), (0, "1".into())]);
    assert_eq!(first[0].energy_wh_interval, 0.5);
    assert_eq!(first[0].cumulative_energy_wh, 0.5);
    assert_eq!(first[0].active_power_w, 345.0);

    assert_eq!(tail.next_batch().await.unwrap().len(), 2);
    assert_eq!(keys(&tail.next_batch().await.unwrap()), vec![(20_000, "1".into())]);
    assert!(tail.next_batch().await.unwrap().is_empty());

    // rows appended later are picked up on the next read
    sink.append(&logged("1", 25_000, 0.5, 2.5)).await.unwrap();
    assert_eq!(keys(&tail.next_batch().await.unwrap()), vec![(25_000, "1".into())]);
}

#[tokio::test]
async fn test_rows_sharing_a_timestamp_are_not_skipped() {
    // simulated meters are stamped with their base meter's poll time
    let sink = store_with(&[
        logged("1", 1_000, 0.0, 0.0),
        logged("2", 1_000, 0.0, 0.0),
        logged("3", 1_000, 0.0, 0.0),
        logged("1", 6_000, 1.0, 1.0),
    ])
    .await;
    let mut tail = LocalDbTail::from_pool(sink.pool().clone(), 2);

    let mut seen = Vec::new();
    loop {
        let batch = tail.next_batch().await.unwrap();
        if batch.is_empty() {
            break;
        }
        seen.extend(keys(&batch));
    }
    assert_eq!(
        seen,
        vec![
            (1_000, "1".into()),
            (1_000, "2".into()),
            (1_000, "3".into()),
            (6_000, "1".into()),
        ]
    );
}

#[tokio::test]
async fn test_row_written_behind_the_last_read_key_is_delivered() {
    let sink = store_with(&[logged("m2", 5_000, 0.0, 0.0)]).await;
    let mut tail = LocalDbTail::from_pool(sink.pool().clone(), 100);
    assert_eq!(keys(&tail.next_batch().await.unwrap()), vec![(5_000, "m2".into())]);

    // same cycle, lower meter id, appended after the tail already read "m2"
    sink.append(&logged("m1", 5_000, 0.0, 0.0)).await.unwrap();
    sink.append(&logged("m2", 10_000, 1.0, 1.0)).await.unwrap();
    assert_eq!(
        keys(&tail.next_batch().await.unwrap()),
        vec![(5_000, "m1".into()), (10_000, "m2".into())]
    );
}

#[tokio::test]
async fn test_rows_replayed_after_a_failed_write_are_delivered() {
    let sink = store_with(&[logged("1", 0, 0.0, 0.0), logged("2", 20_000, 0.0, 0.0)]).await;
    let mut tail = LocalDbTail::from_pool(sink.pool().clone(), 100);
    assert_eq!(tail.next_batch().await.unwrap().len(), 2);

    // meter 1's backlog reaches the store only after newer rows of meter 2
    for (ms, cumulative) in [(5_000, 1.0), (10_000, 2.0), (15_000, 3.0)] {
        sink.append(&logged("1", ms, 1.0, cumulative)).await.unwrap();
    }
    let replayed = tail.next_batch().await.unwrap();
    assert_eq!(
        keys(&replayed),
        vec![(5_000, "1".into()), (10_000, "1".into()), (15_000, "1".into())]
    );
    assert_eq!(replayed.iter().map(|r| r.energy_wh_interval).sum::<f64>(), 3.0);
}

#[tokio::test]
async fn test_start_at_skips_older_rows_and_lists_meters() {
    let sink = store_with(&[
        logged("2", 0, 0.0, 0.0),
        logged("1", 299_000, 1.0, 1.0),
        logged("1", 300_000, 1.0, 2.0),
        logged("2", 305_000, 1.0, 1.0),
    ])
    .await;
    let mut tail = LocalDbTail::from_pool(sink.pool().clone(), 100);
    assert_eq!(tail.meters().await.unwrap(), vec!["1".to_string(), "2".to_string()]);

    tail.start_at(at_ms(300_000));
    let rows = tail.next_batch().await.unwrap();
    assert_eq!(keys(&rows), vec![(300_000, "1".into()), (305_000, "2".into())]);
}

#[test]
fn test_logger_mqtt_payload_is_accepted() {
    let payload = meter_logger::mqtt::encode_row(&logged("7", 1_700_000_000_123, 0.25, 42.0)).unwrap();
    let row = BridgeRow::from_json(&payload).unwrap();
    assert_eq!(row.meter_id, "7");
    assert_eq!(row.timestamp, at_ms(1_700_000_000_123));
    assert_eq!(row.energy_wh_interval, 0.25);
    assert_eq!(row.cumulative_energy_wh, 42.0);
}
