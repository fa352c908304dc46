//! Holding-register layout of the meter and float32 decoding.
//!
//! Every quantity occupies two consecutive 16-bit holding registers carrying an
//! IEEE-754 float32. Meters disagree on byte order, so the four bytes are
//! reordered according to a [`WordOrder`] before interpretation.

use crate::error::{AppError, Result};
use crate::reading::Reading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest block a single "read holding registers" request may ask for.
pub const MAX_BLOCK_REGISTERS: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Voltage,
    Current,
    ActivePower,
    PowerFactor,
    Frequency,
    EnergyRegister,
}

impl Quantity {
    pub const REQUIRED: [Quantity; 5] = [
        Quantity::Voltage,
        Quantity::Current,
        Quantity::ActivePower,
        Quantity::PowerFactor,
        Quantity::Frequency,
    ];
}

/// Byte order of a float32 spread over two registers, named after the
/// position of the big-endian bytes `A B C D` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordOrder {
    #[default]
    Abcd,
    Cdab,
    Badc,
    Dcba,
}

impl WordOrder {
    fn positions(self) -> [usize; 4] {
        match self {
            WordOrder::Abcd => [0, 1, 2, 3],
            WordOrder::Cdab => [2, 3, 0, 1],
            WordOrder::Badc => [1, 0, 3, 2],
            WordOrder::Dcba => [3, 2, 1, 0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub addr: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Overrides the meter-wide word order for this register.
    #[serde(default)]
    pub word_order: Option<WordOrder>,
}

fn default_scale() -> f64 {
    1.0
}

pub type RegisterMap = BTreeMap<Quantity, RegisterSpec>;

/// Register map of the reference three-phase meter. Active power is reported
/// in kW with the import direction negative.
pub fn default_register_map() -> RegisterMap {
    let spec = |addr, scale| RegisterSpec {
        addr,
        scale,
        word_order: None,
    };
    BTreeMap::from([
        (Quantity::Voltage, spec(6, 1.0)),
        (Quantity::Current, spec(8, 1.0)),
        (Quantity::ActivePower, spec(10, -1000.0)),
        (Quantity::PowerFactor, spec(34, 1.0)),
        (Quantity::Frequency, spec(54, 1.0)),
        (Quantity::EnergyRegister, spec(56, 1.0)),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
}

/// Coalesce the registers of a map into as few contiguous block reads as possible.
pub fn plan_blocks(map: &RegisterMap) -> Vec<ReadBlock> {
    let mut addrs: Vec<u16> = map.values().map(|r| r.addr).collect();
    addrs.sort_unstable();
    addrs.dedup();

    let mut blocks: Vec<ReadBlock> = Vec::new();
    for addr in addrs {
        let end = addr.saturating_add(2);
        match blocks.last_mut() {
            Some(block)
                if addr <= block.start + block.count
                    && end - block.start <= MAX_BLOCK_REGISTERS =>
            {
                block.count = block.count.max(end - block.start);
            }
            _ => blocks.push(ReadBlock {
                start: addr,
                count: end - addr,
            }),
        }
    }
    blocks
}

pub fn decode_f32(words: [u16; 2], order: WordOrder) -> f32 {
    let [a, b] = words[0].to_be_bytes();
    let [c, d] = words[1].to_be_bytes();
    let raw = [a, b, c, d];
    let pos = order.positions();
    f32::from_be_bytes([raw[pos[0]], raw[pos[1]], raw[pos[2]], raw[pos[3]]])
}

/// Inverse of [`decode_f32`]: the two register words a meter would report for `value`.
pub fn encode_f32(value: f32, order: WordOrder) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    let pos = order.positions();
    let mut raw = [0u8; 4];
    for (i, p) in pos.iter().enumerate() {
        raw[*p] = bytes[i];
    }
    [
        u16::from_be_bytes([raw[0], raw[1]]),
        u16::from_be_bytes([raw[2], raw[3]]),
    ]
}

/// Decoded register words keyed by register address.
#[derive(Debug, Default, Clone)]
pub struct RegisterImage(BTreeMap<u16, u16>);

impl RegisterImage {
    pub fn insert_block(&mut self, start: u16, words: &[u16]) {
        for (offset, word) in words.iter().enumerate() {
            self.0.insert(start + offset as u16, *word);
        }
    }

    fn pair(&self, addr: u16) -> Option<[u16; 2]> {
        Some([*self.0.get(&addr)?, *self.0.get(&(addr + 1))?])
    }

    fn value(&self, map: &RegisterMap, default_order: WordOrder, q: Quantity) -> Result<Option<f64>> {
        let Some(spec) = map.get(&q) else {
            return Ok(None);
        };
        let words = self.pair(spec.addr).ok_or_else(|| {
            AppError::Transport(format!("register {} missing from response", spec.addr))
        })?;
        let raw = decode_f32(words, spec.word_order.unwrap_or(default_order));
        Ok(Some(f64::from(raw) * spec.scale))
    }

    /// Turn the register image into a calibrated reading.
    pub fn to_reading(
        &self,
        map: &RegisterMap,
        default_order: WordOrder,
        meter_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Reading> {
        let required = |q: Quantity| -> Result<f64> {
            self.value(map, default_order, q)?
                .ok_or_else(|| AppError::Config(format!("register map lacks {:?}", q)))
        };

        Ok(Reading {
            timestamp,
            meter_id: meter_id.to_string(),
            voltage_v: required(Quantity::Voltage)?,
            current_a: required(Quantity::Current)?,
            active_power_w: required(Quantity::ActivePower)?,
            power_factor: required(Quantity::PowerFactor)?,
            frequency_hz: required(Quantity::Frequency)?,
            energy_register_kwh: self.value(map, default_order, Quantity::EnergyRegister)?,
        })
    }
}
