use crate::config::{ReconnectConfig, SerialConfig};
use crate::error::{AppError, Result};
use crate::retry::Backoff;
use crate::source::RegisterTransport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::{info, warn};

/// Device name prefixes of USB serial adapters, in order of preference.
const PORT_PREFIXES: [&str; 2] = ["ttyUSB", "tty.usbserial"];

/// First USB serial adapter under `dir`, preferring Linux device names.
pub fn discover_port_in(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    PORT_PREFIXES
        .iter()
        .find_map(|prefix| names.iter().find(|n| n.starts_with(prefix)))
        .map(|name| dir.join(name))
}

/// Modbus RTU master on a serial line.
///
/// The port is opened lazily on the first read and dropped on any transport
/// failure. Reopening is rate limited by an exponential backoff that never
/// blocks: reads attempted before the next allowed attempt fail immediately,
/// so the poll loop keeps its cadence while the adapter is unplugged.
pub struct ModbusRtuTransport {
    serial: SerialConfig,
    ctx: Option<Context>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl ModbusRtuTransport {
    pub fn new(serial: SerialConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            serial,
            ctx: None,
            backoff: Backoff::new(
                Duration::from_secs(reconnect.initial_delay_secs),
                Duration::from_secs(reconnect.max_delay_secs),
            ),
            retry_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn port_path(&self) -> Result<String> {
        if let Some(port) = &self.serial.port {
            return Ok(port.clone());
        }
        discover_port_in(Path::new("/dev"))
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::Transport("no USB serial adapter found".into()))
    }

    fn open(&self) -> Result<Context> {
        let path = self.port_path()?;
        let builder = tokio_serial::new(&path, self.serial.baud_rate)
            .timeout(Duration::from_millis(self.serial.timeout_ms));
        let port = SerialStream::open(&builder)
            .map_err(|e| AppError::Transport(format!("open {}: {}", path, e)))?;
        info!(port = %path, baud = self.serial.baud_rate, "serial port opened");
        Ok(rtu::attach(port))
    }

    fn connect(&mut self) -> Result<&mut Context> {
        if self.ctx.is_none() {
            if let Some(at) = self.retry_at {
                if Instant::now() < at {
                    return Err(AppError::Transport("serial port reconnect pending".into()));
                }
            }
            match self.open() {
                Ok(ctx) => {
                    self.ctx = Some(ctx);
                    self.retry_at = None;
                    self.backoff.reset();
                }
                Err(e) => {
                    self.schedule_reconnect();
                    return Err(e);
                }
            }
        }
        self.ctx
            .as_mut()
            .ok_or_else(|| AppError::Transport("serial port not connected".into()))
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        warn!(?delay, "serial port unavailable; next attempt after backoff");
        self.retry_at = Some(Instant::now() + delay);
    }
}

#[async_trait]
impl RegisterTransport for ModbusRtuTransport {
    async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        let ctx = self.connect()?;
        ctx.set_slave(Slave(slave));
        match ctx.read_holding_registers(start, count).await {
            Ok(Ok(words)) => Ok(words),
            // the device answered, so the line itself is fine
            Ok(Err(exception)) => Err(AppError::Transport(format!(
                "slave {} exception at {}: {}",
                slave, start, exception
            ))),
            Err(e) => {
                self.ctx = None;
                self.schedule_reconnect();
                Err(AppError::Transport(format!("slave {} read at {}: {}", slave, start, e)))
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            info!("serial port closed");
        }
    }
}
