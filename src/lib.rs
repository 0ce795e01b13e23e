//! XCP-over-serial calibration and measurement client
//!
//! This crate talks to an XCP slave over a byte-stuffed serial framing,
//! resolves symbols from JSON databases, and acquires live values either
//! by host-side polling or through slave-driven DAQ lists.
//!
//! # Architecture
//!
//! - [`database`] - Symbol metadata: parameters, signals, encoding rules,
//!   alignment-aware sizing
//! - [`codec`] - Bytes to raw values to physical values and back
//! - [`transport`] - Framing, the [`Link`](transport::Link) abstraction,
//!   and the listener thread that routes responses and DAQ packets
//! - [`protocol`] - Command codes, packet building, response parsing,
//!   seed/key unlock strategies
//! - [`daq`] - Bin packing of signals into ODTs and slave-side DAQ list
//!   allocation
//! - [`client`] - The session state machine tying it all together
//! - [`context`] - Explicit shared state: databases plus signal configs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xcpcal_rs::{CalContext, SignalConfig, XcpClient};
//! use xcpcal_rs::config::SerialConfig;
//! use xcpcal_rs::transport::serial::SerialLink;
//!
//! # fn main() -> xcpcal_rs::Result<()> {
//! let mut context = CalContext::new();
//! context.load_database("engine.json")?;
//! context.set_signal_config(SignalConfig::polling("engine/rpm"));
//!
//! let mut client = XcpClient::new(Arc::new(context));
//! let link = SerialLink::open(&SerialConfig::default())?;
//! client.connect(Box::new(link))?;
//! let events = client.subscribe();
//! client.setup_measurement()?;
//! client.start_measurement()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod daq;
pub mod database;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{ClientEvent, XcpClient};
pub use context::CalContext;
pub use database::Database;
pub use error::{Result, XcpError};
pub use types::{
    AcquisitionChannel, ByteOrder, ConnectionState, Datatype, Sample, SignalConfig, Value,
};
