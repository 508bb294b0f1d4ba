use ltc6804_lib::monitor::{self, DEFAULT_MAX_ATTEMPTS, DEFAULT_NOISE_FLOOR};
use ltc6804_lib::protocol as proto;
use serde::{Deserialize, Deserializer};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "cellmon.yml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub devices: proto::DeviceCount,
    /// Read attempts per sample, 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_noise_floor",
        deserialize_with = "deserialize_noise_floor"
    )]
    pub noise_floor: f32,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS.get()
}

fn default_noise_floor() -> f32 {
    DEFAULT_NOISE_FLOOR
}

fn deserialize_noise_floor<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    let volts = f32::deserialize(deserializer)?;
    monitor::validate_noise_floor(volts).map_err(serde::de::Error::custom)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            devices: proto::DeviceCount::default(),
            max_attempts: default_max_attempts(),
            noise_floor: default_noise_floor(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_cell_volts")]
    pub cell_volts: f32,
    /// Cells are spread evenly over `cell_volts ± cell_spread`
    #[serde(default = "default_cell_spread")]
    pub cell_spread: f32,
    #[serde(default)]
    pub corrupt_probability: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_cell_volts() -> f32 {
    3.7
}

fn default_cell_spread() -> f32 {
    0.02
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cell_volts: default_cell_volts(),
            cell_spread: default_cell_spread(),
            corrupt_probability: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub adc: proto::AdcConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Loads the given file, else `cellmon.yml` from the working directory if
/// present, else the built-in defaults.
pub(crate) fn get_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = get_config_file_path(path) else {
        log::debug!("No config file found, using defaults");
        return Ok(Config::default());
    };
    log::debug!("Loading config file from {:?}", &path);
    let config_file = File::open(&path)?;
    let config: Config = serde_yaml::from_reader(&config_file)?;

    Ok(config)
}

fn get_config_file_path(path: Option<&Path>) -> Option<PathBuf> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    match (path, default_file) {
        (Some(config), _) => Some(config.to_path_buf()),
        (None, config) if config.exists() => Some(config.to_path_buf()),
        _ => None,
    }
}
