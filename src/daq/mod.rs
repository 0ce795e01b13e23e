//! DAQ list construction: bin packing and slave-side allocation
//!
//! Signals bound to one event channel are packed into object descriptor
//! tables (ODTs) whose payloads must fit a single DAQ transmission, then
//! written to the slave as one DAQ list per channel.

pub mod builder;
pub mod packer;

/// One measured object inside an ODT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdtEntry {
    /// Scoped identifier, `<database>/<name>`
    pub identifier: String,
    /// Slave memory address
    pub address: u64,
    /// Size in bytes (deposit size of the signal)
    pub size: u32,
}

/// An object descriptor table: entries transmitted together in one packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Odt {
    pub entries: Vec<OdtEntry>,
}

impl Odt {
    /// Sum of entry sizes
    pub fn payload_size(&self) -> u32 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// One DAQ list, bound to a slave event channel
#[derive(Debug, Clone)]
pub struct DaqList {
    /// Event channel name as displayed to the user
    pub channel: String,
    /// Event channel number on the slave
    pub event_channel: u16,
    pub odts: Vec<Odt>,
    /// PID of this list's first ODT, assigned when the list is selected
    pub first_pid: u8,
}
