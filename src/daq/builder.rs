//! Slave-side DAQ list allocation and configuration
//!
//! Replays a packed set of [`DaqList`]s onto the slave with the dynamic
//! allocation command sequence: FREE_DAQ, ALLOC_DAQ, per-list ALLOC_ODT,
//! per-ODT ALLOC_ODT_ENTRY, then SET_DAQ_PTR/WRITE_DAQ for every entry and
//! SET_DAQ_LIST_MODE to bind each list to its event channel. Any rejection
//! aborts with a `Setup` error; the slave's allocation state is left as-is
//! and gets cleared by the next FREE_DAQ.

use crate::daq::DaqList;
use crate::error::{Result, XcpError};
use crate::protocol::{
    CommandBuilder, CC_ALLOC_DAQ, CC_ALLOC_ODT, CC_ALLOC_ODT_ENTRY, CC_FREE_DAQ,
    CC_SET_DAQ_LIST_MODE, CC_SET_DAQ_PTR, CC_WRITE_DAQ,
};
use crate::types::ByteOrder;

/// Execution surface for XCP commands
///
/// Implemented by the session client; kept as a trait so the allocation
/// sequence is testable against a scripted recorder.
pub trait CommandPort {
    fn byte_order(&self) -> ByteOrder;

    /// Send one command and return the checked positive-response data
    fn execute(&self, packet: Vec<u8>) -> Result<Vec<u8>>;
}

fn setup_err(stage: &str, err: XcpError) -> XcpError {
    XcpError::Setup(format!("{}: {}", stage, err))
}

/// Allocate and configure `lists` on the slave
///
/// A pure-polling setup has no lists; the slave is left untouched then.
pub fn write_daq_lists(port: &dyn CommandPort, lists: &[DaqList]) -> Result<()> {
    if lists.is_empty() {
        return Ok(());
    }
    let bo = port.byte_order();

    port.execute(CommandBuilder::new(CC_FREE_DAQ, bo).build())
        .map_err(|e| setup_err("FREE_DAQ", e))?;
    port.execute(
        CommandBuilder::new(CC_ALLOC_DAQ, bo)
            .u8(0)
            .u16(lists.len() as u16)
            .build(),
    )
    .map_err(|e| setup_err("ALLOC_DAQ", e))?;

    for (daq, list) in lists.iter().enumerate() {
        let daq = daq as u16;
        port.execute(
            CommandBuilder::new(CC_ALLOC_ODT, bo)
                .u8(0)
                .u16(daq)
                .u8(list.odts.len() as u8)
                .build(),
        )
        .map_err(|e| setup_err("ALLOC_ODT", e))?;
        for (odt, table) in list.odts.iter().enumerate() {
            port.execute(
                CommandBuilder::new(CC_ALLOC_ODT_ENTRY, bo)
                    .u8(0)
                    .u16(daq)
                    .u8(odt as u8)
                    .u8(table.entries.len() as u8)
                    .build(),
            )
            .map_err(|e| setup_err("ALLOC_ODT_ENTRY", e))?;
        }
    }

    for (daq, list) in lists.iter().enumerate() {
        let daq = daq as u16;
        for (odt, table) in list.odts.iter().enumerate() {
            for (entry, item) in table.entries.iter().enumerate() {
                port.execute(
                    CommandBuilder::new(CC_SET_DAQ_PTR, bo)
                        .u8(0)
                        .u16(daq)
                        .u8(odt as u8)
                        .u8(entry as u8)
                        .build(),
                )
                .map_err(|e| setup_err("SET_DAQ_PTR", e))?;
                let address = u32::try_from(item.address).map_err(|_| {
                    XcpError::Setup(format!(
                        "'{}' address 0x{:X} exceeds the 32-bit command range",
                        item.identifier, item.address
                    ))
                })?;
                port.execute(
                    CommandBuilder::new(CC_WRITE_DAQ, bo)
                        .u8(0xFF) // whole-byte element, no bit offset
                        .u8(item.size as u8)
                        .u8(0) // address extension
                        .u32(address)
                        .build(),
                )
                .map_err(|e| setup_err("WRITE_DAQ", e))?;
            }
        }
        port.execute(
            CommandBuilder::new(CC_SET_DAQ_LIST_MODE, bo)
                .u8(0) // plain DAQ direction, no timestamps, no PID_OFF
                .u16(daq)
                .u16(list.event_channel)
                .u8(1) // prescaler
                .u8(0) // priority
                .build(),
        )
        .map_err(|e| setup_err("SET_DAQ_LIST_MODE", e))?;
    }
    Ok(())
}
