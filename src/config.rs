use std::{num::NonZeroUsize, path::Path, time::Duration};

use serde::Deserialize;

use crate::{admission::Caps, error::ConfigError};

pub trait Param<T> {
    fn param(&self) -> T;
}

impl<T: Clone> Param<T> for T {
    fn param(&self) -> T {
        self.clone()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub aria2: Option<Aria2Config>,
    pub telegram: Option<TelegramConfig>,
}

impl Config {
    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config_context = std::fs::read_to_string(path)?;
        Self::parse(&config_context)
    }

    pub fn parse(config_context: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(config_context)?;
        config.monitor.validate()?;
        Ok(config)
    }
}

/// Concurrency caps. `0` means unbounded.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default)]
    pub all: usize,
    #[serde(default)]
    pub download: usize,
    #[serde(default)]
    pub upload: usize,
}

impl QueueConfig {
    pub fn caps(&self) -> Caps {
        Caps {
            all: NonZeroUsize::new(self.all),
            download: NonZeroUsize::new(self.download),
            upload: NonZeroUsize::new(self.upload),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub speed_threshold_kbs: u64,
    pub consecutive_checks: usize,
    pub elapsed_threshold_secs: u64,
    pub long_eta_threshold_secs: u64,
    pub wait_before_cancel_secs: u64,
    pub long_completion_threshold_secs: u64,
    pub cpu_high: u32,
    pub cpu_low: u32,
    pub memory_high: u32,
    pub memory_low: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 60,
            speed_threshold_kbs: 50,
            consecutive_checks: 10,
            elapsed_threshold_secs: 3600,
            long_eta_threshold_secs: 86400,
            wait_before_cancel_secs: 600,
            long_completion_threshold_secs: 86400,
            cpu_high: 85,
            cpu_low: 50,
            memory_high: 70,
            memory_low: 50,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Zero("check_interval_secs"));
        }
        if self.consecutive_checks == 0 {
            return Err(ConfigError::Zero("consecutive_checks"));
        }
        for (field, value) in [
            ("cpu_high", self.cpu_high),
            ("cpu_low", self.cpu_low),
            ("memory_high", self.memory_high),
            ("memory_low", self.memory_low),
        ] {
            if value > 100 {
                return Err(ConfigError::Percentage { field, value });
            }
        }
        if self.cpu_low > self.cpu_high {
            return Err(ConfigError::Inverted {
                low: "cpu_low",
                low_value: self.cpu_low,
                high: "cpu_high",
                high_value: self.cpu_high,
            });
        }
        if self.memory_low > self.memory_high {
            return Err(ConfigError::Inverted {
                low: "memory_low",
                low_value: self.memory_low,
                high: "memory_high",
                high_value: self.memory_high,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Speed threshold in bytes per second.
    #[inline]
    pub fn speed_threshold(&self) -> u64 {
        self.speed_threshold_kbs.saturating_mul(1024)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Aria2Config {
    pub rpc_url: String,
    pub token: String,
    pub channel_buffer_size: Option<usize>,
    pub interval_secs: Option<u64>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelegramConfig {
    pub token: String,
    pub admins: Vec<i64>,
}

impl Param<QueueConfig> for Config {
    fn param(&self) -> QueueConfig {
        self.queue
    }
}

impl Param<MonitorConfig> for Config {
    fn param(&self) -> MonitorConfig {
        self.monitor.clone()
    }
}
