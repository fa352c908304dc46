use crate::aggregate::{AggregateWindow, Push, WindowAggregator};
use crate::config::WriteConfig;
use crate::db::WindowSink;
use crate::error::{AppError, Result};
use crate::row::LoggedRow;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Spawn the task that batches closed windows into upserts.
///
/// A batch is written when it reaches `batch_size` or after `linger_ms`.
/// Failed batches stay queued, up to `retry_capacity` windows, and go out
/// again with the next write. The task ends once every sender is dropped and
/// resolves to the number of windows it could not write.
pub fn spawn_writer<S>(sink: S, cfg: WriteConfig) -> (mpsc::Sender<AggregateWindow>, JoinHandle<usize>)
where
    S: WindowSink + 'static,
{
    let (tx, mut rx) = mpsc::channel::<AggregateWindow>(cfg.batch_size * 4);
    let handle = tokio::spawn(async move {
        let mut writer = BatchWriter::new(sink, cfg.retry_capacity);
        let linger = Duration::from_millis(cfg.linger_ms);
        let mut last_flush = Instant::now();
        loop {
            let timeout = tokio::time::sleep(linger);
            tokio::pin!(timeout);
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    match msg {
                        Some(w) => {
                            writer.buffer.push(w);
                            if writer.buffer.len() >= cfg.batch_size {
                                writer.flush("size").await;
                                last_flush = Instant::now();
                            }
                        }
                        None => {
                            writer.flush("shutdown").await;
                            break;
                        }
                    }
                }
                _ = &mut timeout => {
                    if last_flush.elapsed() >= linger {
                        writer.flush("linger").await;
                        last_flush = Instant::now();
                    }
                }
            }
        }
        let unwritten = writer.retry.len();
        if unwritten > 0 {
            error!(count = unwritten, "windows left unwritten at shutdown");
        }
        unwritten
    });
    (tx, handle)
}

struct BatchWriter<S> {
    sink: S,
    buffer: Vec<AggregateWindow>,
    retry: VecDeque<AggregateWindow>,
    retry_capacity: usize,
}

impl<S: WindowSink> BatchWriter<S> {
    fn new(sink: S, retry_capacity: usize) -> Self {
        Self {
            sink,
            buffer: Vec::new(),
            retry: VecDeque::new(),
            retry_capacity,
        }
    }

    async fn flush(&mut self, reason: &str) {
        if self.buffer.is_empty() && self.retry.is_empty() {
            return;
        }
        let mut batch: Vec<AggregateWindow> = self.retry.drain(..).collect();
        batch.append(&mut self.buffer);

        match self.sink.upsert(&batch).await {
            Ok(()) => debug!(count = batch.len(), reason, "windows flushed"),
            Err(e) => {
                error!(count = batch.len(), reason, "window upsert failed: {e}");
                self.retry.extend(batch);
                while self.retry.len() > self.retry_capacity {
                    if let Some(dropped) = self.retry.pop_front() {
                        error!(
                            meter_id = %dropped.meter_id,
                            window_start = %dropped.window_start,
                            "retry queue full; dropping oldest window"
                        );
                    }
                }
            }
        }
    }
}

/// Feeds rows into the aggregator and hands closed windows to the writer.
pub struct Ingestor {
    aggregator: WindowAggregator,
    tx: mpsc::Sender<AggregateWindow>,
}

impl Ingestor {
    pub fn new(aggregator: WindowAggregator, tx: mpsc::Sender<AggregateWindow>) -> Self {
        Self { aggregator, tx }
    }

    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<()> {
        let row = LoggedRow::from_json(payload)?;
        self.handle_row(row).await
    }

    pub async fn handle_row(&mut self, row: LoggedRow) -> Result<()> {
        match self.aggregator.push(row) {
            Push::Closed(w) => self.emit(w).await,
            Push::Buffered | Push::Late => Ok(()),
        }
    }

    /// Close windows that have been idle past their grace period.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        for w in self.aggregator.close_idle(now) {
            self.emit(w).await?;
        }
        Ok(())
    }

    /// Stop ingesting. Open windows are emitted, marked incomplete, only when
    /// `flush_open` is set; inputs that can replay their rows leave them to
    /// the next run.
    pub async fn finish(mut self, flush_open: bool) -> Result<()> {
        if flush_open {
            let open = self.aggregator.drain();
            info!(count = open.len(), "flushing open windows");
            for w in open {
                self.emit(w).await?;
            }
        }
        Ok(())
    }

    async fn emit(&self, w: AggregateWindow) -> Result<()> {
        self.tx
            .send(w)
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!("send window: {}", e)))
    }
}
