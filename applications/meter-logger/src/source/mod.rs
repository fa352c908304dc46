//! Where readings come from: physical meters on the Modbus RTU bus and
//! simulated meters derived from them.

pub mod modbus;
pub mod simulated;

use crate::config::MeterConfig;
use crate::error::{AppError, Result};
use crate::reading::{MeterId, Reading};
use crate::registers::{plan_blocks, ReadBlock, RegisterImage, RegisterMap, WordOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use simulated::SimulatedSource;

/// Raw register access on a shared bus. One transport serves every physical
/// meter; the slave address selects the device.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>>;

    /// Drop the connection so the next read starts from a fresh one.
    async fn disconnect(&mut self);
}

#[derive(Debug, Clone)]
pub struct PhysicalMeterSource {
    pub meter_id: MeterId,
    pub slave_id: u8,
    registers: RegisterMap,
    word_order: WordOrder,
    blocks: Vec<ReadBlock>,
}

impl PhysicalMeterSource {
    pub fn new(meter_id: impl Into<MeterId>, slave_id: u8, registers: RegisterMap, word_order: WordOrder) -> Self {
        let blocks = plan_blocks(&registers);
        Self {
            meter_id: meter_id.into(),
            slave_id,
            registers,
            word_order,
            blocks,
        }
    }

    /// Read every register block and decode them into one reading stamped `timestamp`.
    pub async fn read<T>(&self, transport: &mut T, timestamp: DateTime<Utc>) -> Result<Reading>
    where
        T: RegisterTransport + ?Sized,
    {
        let mut image = RegisterImage::default();
        for block in &self.blocks {
            let words = transport
                .read_holding_registers(self.slave_id, block.start, block.count)
                .await?;
            if words.len() != block.count as usize {
                return Err(AppError::Transport(format!(
                    "short response from slave {}: asked for {} registers at {}, got {}",
                    self.slave_id,
                    block.count,
                    block.start,
                    words.len()
                )));
            }
            image.insert_block(block.start, &words);
        }
        image.to_reading(&self.registers, self.word_order, &self.meter_id, timestamp)
    }
}

pub enum ReadingSource {
    Physical(PhysicalMeterSource),
    Simulated(SimulatedSource),
}

impl ReadingSource {
    pub fn meter_id(&self) -> &str {
        match self {
            ReadingSource::Physical(p) => &p.meter_id,
            ReadingSource::Simulated(s) => s.meter_id(),
        }
    }
}

/// Physical meters first, then simulated ones, in configuration order.
pub fn build_sources(cfg: &MeterConfig) -> Vec<ReadingSource> {
    let physical = cfg.meters.iter().map(|m| {
        ReadingSource::Physical(PhysicalMeterSource::new(
            m.meter_id.clone(),
            m.slave_id,
            cfg.registers.clone(),
            cfg.word_order,
        ))
    });
    let simulated = cfg
        .simulated
        .iter()
        .map(|s| ReadingSource::Simulated(SimulatedSource::new(s)));
    physical.chain(simulated).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{default_register_map, encode_f32};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    /// Serves register words from a fixed image and records requests.
    struct ImageTransport {
        words: BTreeMap<u16, u16>,
        requests: Vec<(u8, u16, u16)>,
        truncate: bool,
    }

    #[async_trait]
    impl RegisterTransport for ImageTransport {
        async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>> {
            self.requests.push((slave, start, count));
            let mut out: Vec<u16> = (start..start + count)
                .map(|a| self.words.get(&a).copied().unwrap_or(0))
                .collect();
            if self.truncate {
                out.pop();
            }
            Ok(out)
        }

        async fn disconnect(&mut self) {}
    }

    fn transport(truncate: bool) -> ImageTransport {
        let mut words = BTreeMap::new();
        for (addr, v) in [(6u16, 229.5f32), (8, 2.0), (10, -0.5), (34, 0.9), (54, 50.0), (56, 1.0)] {
            let [hi, lo] = encode_f32(v, WordOrder::Cdab);
            words.insert(addr, hi);
            words.insert(addr + 1, lo);
        }
        ImageTransport {
            words,
            requests: Vec::new(),
            truncate,
        }
    }

    #[tokio::test]
    async fn test_physical_source_reads_planned_blocks() {
        let source = PhysicalMeterSource::new("1", 7, default_register_map(), WordOrder::Cdab);
        let mut t = transport(false);
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let reading = source.read(&mut t, ts).await.unwrap();
        assert_eq!(t.requests, vec![(7, 6, 6), (7, 34, 2), (7, 54, 4)]);
        assert_eq!(reading.voltage_v, 229.5);
        assert_eq!(reading.active_power_w, 500.0);
        assert_eq!(reading.timestamp, ts);
    }

    #[tokio::test]
    async fn test_short_response_is_transient() {
        let source = PhysicalMeterSource::new("1", 1, default_register_map(), WordOrder::Cdab);
        let mut t = transport(true);
        let err = source.read(&mut t, Utc::now()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
