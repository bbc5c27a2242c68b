// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML configuration of passthrough device migration.
//!
//! ```toml
//! [migration]
//! enable = true
//! data-buffer-size = 1048576
//!
//! [dev.nic0]
//! sysfsdev = "/sys/bus/pci/devices/0000:3b:00.1"
//! enable-migration = false
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DEFAULT_DATA_BUFFER_SIZE;
use crate::lifecycle::MigrationOpts;

fn default_enable() -> bool {
    true
}

fn default_data_buffer_size() -> usize {
    DEFAULT_DATA_BUFFER_SIZE
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default, rename = "dev")]
    pub devices: BTreeMap<String, Device>,
}

/// Settings applying to every passthrough device.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MigrationConfig {
    /// Whether passthrough devices take part in migration at all.
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// Size (in bytes) of the buffer used to move device state.
    #[serde(default = "default_data_buffer_size")]
    pub data_buffer_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            data_buffer_size: default_data_buffer_size(),
        }
    }
}

/// A passthrough device.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Device {
    /// sysfs path of the host device.
    pub sysfsdev: String,

    /// Overrides [`MigrationConfig::enable`] for this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_migration: Option<bool>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data-buffer-size must be non-zero")]
    InvalidBufferSize,
}

impl Config {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.migration.data_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(self)
    }

    /// Is migration enabled for the device `name`?
    ///
    /// Devices without a table of their own follow the global setting.
    pub fn enable_for(&self, name: &str) -> bool {
        self.devices
            .get(name)
            .and_then(|dev| dev.enable_migration)
            .unwrap_or(self.migration.enable)
    }

    /// Effective migration settings for the device `name`.
    pub fn opts_for(&self, name: &str) -> MigrationOpts {
        MigrationOpts {
            enable_migration: self.enable_for(name),
            data_buffer_size: self.migration.data_buffer_size,
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str::<Config>(s)?.validate()
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
