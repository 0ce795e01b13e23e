//! Device and transport configuration
//!
//! Configuration is plain JSON deserialized with serde. Every field has a
//! default so a minimal file (or none at all) yields a working local setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Serial port settings for the slave link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name, e.g. `COM1` or `/dev/ttyUSB0`
    pub port: String,
    /// Baud rate in bits per second
    pub bitrate: u32,
    /// Data bits per character
    pub byte_size: u8,
    /// Parity: `N`, `E`, or `O`
    pub parity: char,
    /// Stop bits
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "COM1".to_string(),
            bitrate: 115_200,
            byte_size: 8,
            parity: 'N',
            stop_bits: 1,
        }
    }
}

/// Top-level device configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name of the device
    pub name: String,
    /// Symbol database files to load for this device
    pub databases: Vec<PathBuf>,
    /// Serial link settings
    pub serial: SerialConfig,
}

impl DeviceConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}
