use crate::error::{AppError, Result};
use crate::registers::{default_register_map, Quantity, RegisterMap, WordOrder};
use crate::retry::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub meter: MeterConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub accrual: AccrualConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    pub storage: StorageConfig,
    /// Relay of accepted rows to a broker; disabled when absent.
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound for one meter read including retries.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_register_map")]
    pub registers: RegisterMap,
    pub meters: Vec<PhysicalMeterConfig>,
    #[serde(default)]
    pub simulated: Vec<SimulatedMeterConfig>,
}

fn default_interval_secs() -> u64 {
    5
}
fn default_poll_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path; the first USB serial adapter found is used when absent.
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_serial_timeout_ms() -> u64 {
    1000
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalMeterConfig {
    pub meter_id: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
}

fn default_slave_id() -> u8 {
    1
}

/// A logical meter derived from a physical one by scaling and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedMeterConfig {
    pub meter_id: String,
    /// meter_id of the physical meter providing the base reading
    pub base: String,
    pub factor: f64,
    /// Relative half-width of the uniform jitter, e.g. 0.05 for ±5%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_jitter() -> f64 {
    0.05
}

/// Physical plausibility bounds applied to every reading before accrual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub min_voltage_v: f64,
    #[serde(default = "default_max_voltage_v")]
    pub max_voltage_v: f64,
    #[serde(default = "default_max_current_a")]
    pub max_current_a: f64,
    #[serde(default)]
    pub min_active_power_w: f64,
    #[serde(default = "default_max_active_power_w")]
    pub max_active_power_w: f64,
    #[serde(default = "default_min_frequency_hz")]
    pub min_frequency_hz: f64,
    #[serde(default = "default_max_frequency_hz")]
    pub max_frequency_hz: f64,
}

fn default_max_voltage_v() -> f64 {
    300.0
}
fn default_max_current_a() -> f64 {
    100.0
}
fn default_max_active_power_w() -> f64 {
    25_000.0
}
fn default_min_frequency_hz() -> f64 {
    45.0
}
fn default_max_frequency_hz() -> f64 {
    65.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_voltage_v: 0.0,
            max_voltage_v: default_max_voltage_v(),
            max_current_a: default_max_current_a(),
            min_active_power_w: 0.0,
            max_active_power_w: default_max_active_power_w(),
            min_frequency_hz: default_min_frequency_hz(),
            max_frequency_hz: default_max_frequency_hz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccrualConfig {
    /// Gaps longer than this many poll intervals are logged as downtime.
    #[serde(default = "default_gap_warn_factor")]
    pub gap_warn_factor: f64,
    /// Optional ceiling on the integrated gap. Unset integrates every gap in full.
    #[serde(default)]
    pub max_gap_secs: Option<u64>,
}

fn default_gap_warn_factor() -> f64 {
    10.0
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            gap_warn_factor: default_gap_warn_factor(),
            max_gap_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub max_delay_secs: u64,
}

fn default_reconnect_initial_secs() -> u64 {
    2
}
fn default_reconnect_max_secs() -> u64 {
    60
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_reconnect_initial_secs(),
            max_delay_secs: default_reconnect_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL, e.g. "sqlite://log_files/smart_meter.db"
    pub url: String,
    /// Rows kept in memory while the local store is failing.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

fn default_pending_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic() -> String {
    "pes/campus/energy/meter/reading".into()
}
fn default_qos() -> u8 {
    1
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards LOCAL_DB_URL and MQTT_HOST, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(url) = std::env::var("LOCAL_DB_URL") {
            cfg.storage.url = url;
        }
        if let (Ok(host), Some(mqtt)) = (std::env::var("MQTT_HOST"), cfg.mqtt.as_mut()) {
            mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let meter = &self.meter;
        if meter.interval_secs == 0 {
            return Err(AppError::Config("meter.interval_secs must be positive".into()));
        }
        if meter.meters.is_empty() {
            return Err(AppError::Config(
                "config must include at least one physical meter".into(),
            ));
        }
        for q in Quantity::REQUIRED {
            if !meter.registers.contains_key(&q) {
                return Err(AppError::Config(format!(
                    "meter.registers lacks required quantity {:?}",
                    q
                )));
            }
        }

        let mut ids = HashSet::new();
        let physical: HashSet<&str> = meter.meters.iter().map(|m| m.meter_id.as_str()).collect();
        let all_ids = meter
            .meters
            .iter()
            .map(|m| &m.meter_id)
            .chain(meter.simulated.iter().map(|s| &s.meter_id));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(AppError::Config(format!("duplicate meter_id '{}'", id)));
            }
        }

        for sim in &meter.simulated {
            if !physical.contains(sim.base.as_str()) {
                return Err(AppError::Config(format!(
                    "simulated meter '{}' refers to unknown physical meter '{}'",
                    sim.meter_id, sim.base
                )));
            }
            if !(sim.factor.is_finite() && sim.factor > 0.0) {
                return Err(AppError::Config(format!(
                    "simulated meter '{}' factor must be positive",
                    sim.meter_id
                )));
            }
            if !(0.0..1.0).contains(&sim.jitter) {
                return Err(AppError::Config(format!(
                    "simulated meter '{}' jitter must be within [0, 1)",
                    sim.meter_id
                )));
            }
        }

        let v = &self.validation;
        let ordered = [
            (v.min_voltage_v, v.max_voltage_v, "voltage"),
            (v.min_active_power_w, v.max_active_power_w, "active power"),
            (v.min_frequency_hz, v.max_frequency_hz, "frequency"),
            (0.0, v.max_current_a, "current"),
        ];
        for (min, max, name) in ordered {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(AppError::Config(format!(
                    "validation bounds for {} are empty or not finite",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders from the environment; "$$" is a literal "$".
/// A bare "$" not followed by a placeholder is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String> {
    let re = Regex::new(r"\$(?:(\$)|\(([A-Za-z_][A-Za-z0-9_]*)\)|\{([A-Za-z_][A-Za-z0-9_]*)\})")
        .map_err(|e| AppError::Config(format!("placeholder pattern: {}", e)))?;

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&input[last..whole.start()]);
        if caps.get(1).is_some() {
            out.push('$');
        } else {
            let name = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = std::env::var(name).map_err(|_| {
                AppError::Config(format!("missing environment variable: {}", name))
            })?;
            out.push_str(&value);
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
