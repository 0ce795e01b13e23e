//! Core data types for the XCP calibration client
//!
//! This module contains the fundamental data structures used throughout
//! the crate for representing datatypes, decoded values, live samples,
//! and per-signal acquisition configuration.
//!
//! # Main Types
//!
//! - [`Datatype`] - The fixed enumeration of slave-side storage types
//! - [`ByteOrder`] - Most- or least-significant byte first
//! - [`Value`] - Tagged union of decoded raw/physical values
//! - [`Sample`] - A single timestamped measurement emitted to listeners
//! - [`SignalConfig`] - How one signal is acquired (polling vs. DAQ event)
//!
//! # Values
//!
//! Raw and physical values share the [`Value`] representation. Numeric
//! encodings preserve the kind of their input: integer datatypes stay
//! [`Value::Integer`] through linear scaling, floats stay [`Value::Float`].
//! Dictionary encodings map integers to [`Value::Text`] labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed enumeration of slave-side datatypes
///
/// Names follow the database document's enum spelling (`UBYTE`,
/// `FLOAT32_IEEE`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Datatype {
    /// 8-bit unsigned integer
    Ubyte,
    /// 8-bit signed integer
    Sbyte,
    /// 16-bit unsigned integer
    Uword,
    /// 16-bit signed integer
    Sword,
    /// 32-bit unsigned integer
    Ulong,
    /// 32-bit signed integer
    Slong,
    /// 64-bit unsigned integer
    #[serde(rename = "A_UINT64")]
    AUint64,
    /// 64-bit signed integer
    #[serde(rename = "A_INT64")]
    AInt64,
    /// 32-bit IEEE-754 float
    #[serde(rename = "FLOAT32_IEEE")]
    Float32Ieee,
    /// 64-bit IEEE-754 float
    #[serde(rename = "FLOAT64_IEEE")]
    Float64Ieee,
}

impl Datatype {
    /// Native size of the datatype in bytes, before alignment
    pub fn native_size(&self) -> u32 {
        match self {
            Datatype::Ubyte | Datatype::Sbyte => 1,
            Datatype::Uword | Datatype::Sword => 2,
            Datatype::Ulong | Datatype::Slong | Datatype::Float32Ieee => 4,
            Datatype::AUint64 | Datatype::AInt64 | Datatype::Float64Ieee => 8,
        }
    }

    /// Whether the datatype decodes as a two's-complement signed integer
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Datatype::Sbyte | Datatype::Sword | Datatype::Slong | Datatype::AInt64
        )
    }

    /// Whether the datatype decodes as an IEEE-754 float
    pub fn is_float(&self) -> bool {
        matches!(self, Datatype::Float32Ieee | Datatype::Float64Ieee)
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Datatype::Ubyte => "UBYTE",
            Datatype::Sbyte => "SBYTE",
            Datatype::Uword => "UWORD",
            Datatype::Sword => "SWORD",
            Datatype::Ulong => "ULONG",
            Datatype::Slong => "SLONG",
            Datatype::AUint64 => "A_UINT64",
            Datatype::AInt64 => "A_INT64",
            Datatype::Float32Ieee => "FLOAT32_IEEE",
            Datatype::Float64Ieee => "FLOAT64_IEEE",
        };
        write!(f, "{}", name)
    }
}

/// Byte order of multi-byte values in slave memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ByteOrder {
    /// Big-endian
    MsbFirst,
    /// Little-endian
    #[default]
    MsbLast,
}

/// A decoded raw or physical value
///
/// The variants are matched exhaustively wherever a value is consumed so
/// that new kinds fail to compile instead of silently falling through.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer value (any signed/unsigned integer datatype)
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// Textual value (dictionary label or decoded ASCII parameter)
    Text(String),
    /// Array of integer values
    IntArray(Vec<i64>),
    /// Array of floating-point values
    FloatArray(Vec<f64>),
    /// Raw bytes (ASCII parameters expose these alongside the string form)
    Bytes(Vec<u8>),
}

impl Value {
    /// Best-effort numeric view, used by sinks that plot every sample
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) | Value::IntArray(_) | Value::FloatArray(_) | Value::Bytes(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::IntArray(v) => write!(f, "{:?}", v),
            Value::FloatArray(v) => write!(f, "{:?}", v),
            Value::Bytes(b) => write!(f, "{:02X?}", b),
        }
    }
}

/// A single timestamped measurement
///
/// Samples are transient: they are published to listeners and not retained
/// by the core. Retention is the embedding layer's responsibility.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Scoped identifier, `<database>/<name>`
    pub identifier: String,
    /// Value as decoded from slave memory
    pub raw: Value,
    /// Value after applying the symbol's encoding rule
    pub physical: Value,
    /// Arrival timestamp (monotonic clock correlated to wall-clock origin)
    pub timestamp: DateTime<Utc>,
}

/// Acquisition channel for one signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionChannel {
    /// Read on demand at a fixed host-side interval
    Polling,
    /// Pushed autonomously by the slave on a named event channel
    Event(String),
}

/// Per-signal acquisition configuration
///
/// Created and edited by the embedding layer; read by the client at
/// `setup_measurement` time and never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Scoped identifier, `<database>/<name>`
    pub identifier: String,
    /// Where the samples come from
    pub channel: AcquisitionChannel,
    /// Poll interval in milliseconds (meaningful only for polling)
    pub rate_ms: u64,
    /// Whether this signal participates in the next measurement
    pub enabled: bool,
}

impl SignalConfig {
    /// Create a polling configuration with the default 100 ms interval
    pub fn polling(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            channel: AcquisitionChannel::Polling,
            rate_ms: 100,
            enabled: true,
        }
    }

    /// Create a DAQ configuration bound to a named event channel
    pub fn daq(identifier: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            channel: AcquisitionChannel::Event(channel.into()),
            rate_ms: 0,
            enabled: true,
        }
    }

    /// Set the poll interval
    pub fn with_rate_ms(mut self, rate_ms: u64) -> Self {
        self.rate_ms = rate_ms;
        self
    }

    /// Set the enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Session state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session with the slave
    #[default]
    Disconnected,
    /// Transport opening and capability negotiation in progress
    Connecting,
    /// Session established, no acquisition running
    Connected,
    /// Acquisition loops running
    Measuring,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Measuring => write!(f, "Measuring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_native_size() {
        assert_eq!(Datatype::Ubyte.native_size(), 1);
        assert_eq!(Datatype::Sword.native_size(), 2);
        assert_eq!(Datatype::Ulong.native_size(), 4);
        assert_eq!(Datatype::AInt64.native_size(), 8);
        assert_eq!(Datatype::Float32Ieee.native_size(), 4);
        assert_eq!(Datatype::Float64Ieee.native_size(), 8);
    }

    #[test]
    fn test_datatype_serde_names() {
        let dt: Datatype = serde_json::from_str("\"FLOAT32_IEEE\"").unwrap();
        assert_eq!(dt, Datatype::Float32Ieee);
        let dt: Datatype = serde_json::from_str("\"A_UINT64\"").unwrap();
        assert_eq!(dt, Datatype::AUint64);
        let dt: Datatype = serde_json::from_str("\"UBYTE\"").unwrap();
        assert_eq!(dt, Datatype::Ubyte);
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(Value::Integer(-3).as_f64(), Some(-3.0));
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Text("idle".into()).as_f64(), None);
    }

    #[test]
    fn test_signal_config_builders() {
        let sc = SignalConfig::polling("engine/RPM").with_rate_ms(50);
        assert_eq!(sc.channel, AcquisitionChannel::Polling);
        assert_eq!(sc.rate_ms, 50);
        assert!(sc.enabled);

        let sc = SignalConfig::daq("engine/RPM", "10ms task").with_enabled(false);
        assert_eq!(sc.channel, AcquisitionChannel::Event("10ms task".into()));
        assert!(!sc.enabled);
    }
}
