use crate::error::{AppError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub input: InputConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

/// Where logged rows come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputConfig {
    /// Live relay from the logger. Not replayable, so open windows are flushed on shutdown.
    Mqtt(MqttConfig),
    /// Tail of the logger's SQLite file. Replayable from the remote store's resume point.
    LocalDb(LocalDbConfig),
}

impl InputConfig {
    /// A durable input can be re-read after a restart.
    pub fn is_durable(&self) -> bool {
        matches!(self, InputConfig::LocalDb(_))
    }
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDbConfig {
    /// SQLite URL of the logger's store, e.g. "sqlite://log_files/smart_meter.db"
    pub url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_tail_batch_size")]
    pub batch_size: u32,
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_tail_batch_size() -> u32 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub write: WriteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Windows kept for retry while the remote store is unavailable.
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
}

fn default_batch_size() -> usize {
    100
}
fn default_linger_ms() -> u64 {
    1000
}
fn default_retry_capacity() -> usize {
    10_000
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            retry_capacity: default_retry_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_size_secs")]
    pub size_secs: u64,
    /// Close a window this long after its end even if no newer row arrived.
    #[serde(default)]
    pub idle_close_secs: Option<u64>,
}

fn default_window_size_secs() -> u64 {
    300
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_secs: default_window_size_secs(),
            idle_close_secs: None,
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// DATABASE_URL, MQTT_HOST and LOCAL_DB_URL, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
        match &mut cfg.input {
            InputConfig::Mqtt(m) => {
                if let Ok(host) = std::env::var("MQTT_HOST") {
                    m.host = host;
                }
            }
            InputConfig::LocalDb(l) => {
                if let Ok(url) = std::env::var("LOCAL_DB_URL") {
                    l.url = url;
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.window.size_secs == 0 {
            return Err(AppError::Config("window.size_secs must be positive".into()));
        }
        if self.database.write.batch_size == 0 {
            return Err(AppError::Config("database.write.batch_size must be positive".into()));
        }
        if let InputConfig::LocalDb(l) = &self.input {
            if l.batch_size == 0 || l.poll_interval_ms == 0 {
                return Err(AppError::Config(
                    "input.local_db batch_size and poll_interval_ms must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders from the environment; "$$" is a literal "$".
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
