use crate::config::SimulatedMeterConfig;
use crate::reading::{MeterId, Reading};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A logical meter that mirrors a physical one at a fixed load ratio.
///
/// Current and active power are scaled by `factor` and a single uniform jitter
/// draw per reading, so the simulated power stays consistent with its current.
/// Voltage, power factor and frequency are shared with the base meter since
/// both hang off the same supply.
pub struct SimulatedSource {
    meter_id: MeterId,
    base_meter_id: MeterId,
    factor: f64,
    jitter: f64,
    rng: StdRng,
}

impl SimulatedSource {
    pub fn new(cfg: &SimulatedMeterConfig) -> Self {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    /// Deterministic jitter sequence.
    pub fn with_seed(cfg: &SimulatedMeterConfig, seed: u64) -> Self {
        Self::with_rng(cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(cfg: &SimulatedMeterConfig, rng: StdRng) -> Self {
        Self {
            meter_id: cfg.meter_id.clone(),
            base_meter_id: cfg.base.clone(),
            factor: cfg.factor,
            jitter: cfg.jitter,
            rng,
        }
    }

    pub fn meter_id(&self) -> &str {
        &self.meter_id
    }

    pub fn base_meter_id(&self) -> &str {
        &self.base_meter_id
    }

    /// Derive this meter's reading from the base meter's reading of the same cycle.
    pub fn next(&mut self, base: &Reading) -> Reading {
        let scale = if self.jitter > 0.0 {
            self.factor * self.rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            self.factor
        };
        Reading {
            timestamp: base.timestamp,
            meter_id: self.meter_id.clone(),
            voltage_v: base.voltage_v,
            current_a: (base.current_a * scale).max(0.0),
            active_power_w: (base.active_power_w * scale).max(0.0),
            power_factor: base.power_factor,
            frequency_hz: base.frequency_hz,
            energy_register_kwh: None,
        }
    }
}
