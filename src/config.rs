use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::OperationMode;
use crate::core::monitor::PollTiming;
use crate::core::transfer_engine::NativeCopyEngine;
use crate::core::transfer_engine::native_copy::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_CONFIG_FILE: &str = "splitflash.toml";
pub const ENV_PREFIX: &str = "SPLITFLASH_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// How long to wait for a half to show up as a volume.
    pub new_drive_timeout_secs: u64,
    /// How long to wait for the volume to go away after a write.
    pub removal_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub chunk_size: usize,
    pub sync_after_write: bool,
    /// Unmount volumes that survive a complete write.
    pub eject_after_write: bool,
    /// Skip the interactive prompt and run this mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<OperationMode>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            new_drive_timeout_secs: 60,
            removal_timeout_secs: 30,
            poll_interval_ms: 500,
            settle_delay_ms: 1000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_after_write: true,
            eject_after_write: false,
            mode: None,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `SPLITFLASH_*` variables and the
    /// command-line `overrides`, later sources winning.
    ///
    /// An explicitly named config file must exist; the default one is
    /// optional.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: T) -> Result<Self> {
        let path = match config_file {
            Some(path) if !path.exists() => {
                bail!("Config file not found: {}", path.display())
            }
            Some(path) => path,
            None => Path::new(DEFAULT_CONFIG_FILE),
        };

        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract().context("Invalid configuration")?;

        if config.poll_interval_ms == 0 || config.poll_interval_ms > 1000 {
            bail!(
                "poll_interval_ms must be between 1 and 1000, got {}",
                config.poll_interval_ms
            );
        }
        if config.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }

        Ok(config)
    }

    pub fn new_drive_timeout(&self) -> Duration {
        Duration::from_secs(self.new_drive_timeout_secs)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_secs(self.removal_timeout_secs)
    }

    pub fn poll_timing(&self) -> PollTiming {
        PollTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn transfer_engine(&self) -> NativeCopyEngine {
        NativeCopyEngine {
            chunk_size: self.chunk_size,
            sync_files: self.sync_after_write,
        }
    }
}
