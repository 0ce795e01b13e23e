//! XCP command surface: codes, packet building, response parsing
//!
//! Packets are built with [`CommandBuilder`] and parsed with
//! [`PacketReader`], both honoring the slave's byte order for multi-byte
//! fields. [`check_response`] splits positive responses from slave error
//! packets and maps error codes to their symbolic names.

use crate::error::{Result, XcpError};
use crate::types::ByteOrder;

pub mod seedkey;

/// Default command/response timeout
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(750);

// Standard command codes, descending as the protocol assigns them.
pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_GET_SEED: u8 = 0xF8;
pub const CC_UNLOCK: u8 = 0xF7;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;

// Resource flags shared by CONNECT and GET_STATUS.
pub const RESOURCE_CALPAG: u8 = 0x01;
pub const RESOURCE_DAQ: u8 = 0x04;
pub const RESOURCE_STIM: u8 = 0x08;
pub const RESOURCE_PGM: u8 = 0x10;

/// Symbolic name for a slave error code
pub fn error_name(code: u8) -> &'static str {
    match code {
        0x00 => "ERR_CMD_SYNCH",
        0x10 => "ERR_CMD_BUSY",
        0x11 => "ERR_DAQ_ACTIVE",
        0x12 => "ERR_PGM_ACTIVE",
        0x20 => "ERR_CMD_UNKNOWN",
        0x21 => "ERR_CMD_SYNTAX",
        0x22 => "ERR_OUT_OF_RANGE",
        0x23 => "ERR_WRITE_PROTECTED",
        0x24 => "ERR_ACCESS_DENIED",
        0x25 => "ERR_ACCESS_LOCKED",
        0x26 => "ERR_PAGE_NOT_VALID",
        0x27 => "ERR_MODE_NOT_VALID",
        0x28 => "ERR_SEGMENT_NOT_VALID",
        0x29 => "ERR_SEQUENCE",
        0x2A => "ERR_DAQ_CONFIG",
        0x30 => "ERR_MEMORY_OVERFLOW",
        0x31 => "ERR_GENERIC",
        0x32 => "ERR_VERIFY",
        0x33 => "ERR_RESOURCE_TEMPORARY_NOT_ACCESSIBLE",
        _ => "ERR_UNDEFINED",
    }
}

/// Split a response packet into its data bytes
///
/// Positive responses yield everything after the `0xFF` marker. Error
/// packets become [`XcpError::Slave`] tagged with the command that
/// triggered them; anything else is a protocol violation.
pub fn check_response<'a>(payload: &'a [u8], command: u8) -> Result<&'a [u8]> {
    match payload.first() {
        Some(&0xFF) => Ok(&payload[1..]),
        Some(&0xFE) => {
            let code = payload.get(1).copied().unwrap_or(0x31);
            Err(XcpError::Slave {
                code,
                name: error_name(code),
                command,
            })
        }
        Some(&other) => Err(XcpError::ProtocolViolation(format!(
            "unexpected response pid 0x{:02X} to command 0x{:02X}",
            other, command
        ))),
        None => Err(XcpError::ProtocolViolation(format!(
            "empty response to command 0x{:02X}",
            command
        ))),
    }
}

/// Builder for outgoing command packets
///
/// Multi-byte fields are emitted in the slave's byte order.
#[derive(Debug)]
pub struct CommandBuilder {
    bytes: Vec<u8>,
    byte_order: ByteOrder,
}

impl CommandBuilder {
    pub fn new(command: u8, byte_order: ByteOrder) -> Self {
        Self {
            bytes: vec![command],
            byte_order,
        }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        match self.byte_order {
            ByteOrder::MsbFirst => self.bytes.extend_from_slice(&value.to_be_bytes()),
            ByteOrder::MsbLast => self.bytes.extend_from_slice(&value.to_le_bytes()),
        }
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        match self.byte_order {
            ByteOrder::MsbFirst => self.bytes.extend_from_slice(&value.to_be_bytes()),
            ByteOrder::MsbLast => self.bytes.extend_from_slice(&value.to_le_bytes()),
        }
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Sequential reader over response data bytes
#[derive(Debug)]
pub struct PacketReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    byte_order: ByteOrder,
}

impl<'a> PacketReader<'a> {
    pub fn new(bytes: &'a [u8], byte_order: ByteOrder) -> Self {
        Self {
            bytes,
            pos: 0,
            byte_order,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(XcpError::ProtocolViolation(format!(
                "response truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(match self.byte_order {
            ByteOrder::MsbFirst => u16::from_be_bytes([b[0], b[1]]),
            ByteOrder::MsbLast => u16::from_le_bytes([b[0], b[1]]),
        })
    }
}

/// Address granularity advertised in `COMM_MODE_BASIC`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressGranularity {
    Byte,
    Word,
    Dword,
}

impl AddressGranularity {
    pub fn bytes(&self) -> u32 {
        match self {
            AddressGranularity::Byte => 1,
            AddressGranularity::Word => 2,
            AddressGranularity::Dword => 4,
        }
    }
}

/// Capabilities negotiated by CONNECT
#[derive(Debug, Clone)]
pub struct SlaveProperties {
    pub supports_calpag: bool,
    pub supports_daq: bool,
    pub supports_stim: bool,
    pub supports_pgm: bool,
    pub byte_order: ByteOrder,
    pub address_granularity: AddressGranularity,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl SlaveProperties {
    /// Parse a CONNECT response (data bytes after the positive marker)
    ///
    /// The byte order governing `max_dto` comes from this very packet, so
    /// `COMM_MODE_BASIC` is decoded before the multi-byte fields.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(XcpError::ProtocolViolation(format!(
                "CONNECT response has {} data bytes, expected 7",
                data.len()
            )));
        }
        let resource = data[0];
        let comm_mode = data[1];
        let byte_order = if comm_mode & 0x01 != 0 {
            ByteOrder::MsbFirst
        } else {
            ByteOrder::MsbLast
        };
        let address_granularity = match (comm_mode >> 1) & 0x03 {
            0 => AddressGranularity::Byte,
            1 => AddressGranularity::Word,
            2 => AddressGranularity::Dword,
            g => {
                return Err(XcpError::ProtocolViolation(format!(
                    "reserved address granularity {}",
                    g
                )))
            }
        };
        let mut reader = PacketReader::new(&data[2..], byte_order);
        let max_cto = reader.u8()?;
        let max_dto = reader.u16()?;
        let protocol_version = reader.u8()?;
        let transport_version = reader.u8()?;
        Ok(Self {
            supports_calpag: resource & RESOURCE_CALPAG != 0,
            supports_daq: resource & RESOURCE_DAQ != 0,
            supports_stim: resource & RESOURCE_STIM != 0,
            supports_pgm: resource & RESOURCE_PGM != 0,
            byte_order,
            address_granularity,
            max_cto,
            max_dto,
            protocol_version,
            transport_version,
        })
    }
}

/// Resource protection state from GET_STATUS
#[derive(Debug, Clone, Copy)]
pub struct ProtectionStatus {
    pub session_status: u8,
    pub calpag_locked: bool,
    pub daq_locked: bool,
    pub stim_locked: bool,
    pub pgm_locked: bool,
}

impl ProtectionStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(XcpError::ProtocolViolation(format!(
                "GET_STATUS response has {} data bytes, expected at least 2",
                data.len()
            )));
        }
        let protection = data[1];
        Ok(Self {
            session_status: data[0],
            calpag_locked: protection & RESOURCE_CALPAG != 0,
            daq_locked: protection & RESOURCE_DAQ != 0,
            stim_locked: protection & RESOURCE_STIM != 0,
            pgm_locked: protection & RESOURCE_PGM != 0,
        })
    }
}

/// Layout of the identification field at the head of every DAQ packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationField {
    /// Absolute ODT number, data starts at byte 1
    AbsoluteOdt,
    /// Relative ODT number plus DAQ list number as a byte
    RelativeOdtByte,
    /// Relative ODT number plus DAQ list number as a word
    RelativeOdtWord,
    /// Relative ODT number plus word-aligned DAQ list number
    RelativeOdtWordAligned,
}

/// Parsed identification field of one DAQ packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtoHeader {
    /// ODT number (absolute or list-relative, per the field mode)
    pub odt: u8,
    /// DAQ list number, absent in absolute mode
    pub daq_list: Option<u16>,
    /// Offset of the first sample byte
    pub data_start: usize,
}

impl IdentificationField {
    /// Bytes consumed by the identification field at the packet head
    pub fn header_len(&self) -> usize {
        match self {
            IdentificationField::AbsoluteOdt => 1,
            IdentificationField::RelativeOdtByte => 2,
            IdentificationField::RelativeOdtWord => 3,
            IdentificationField::RelativeOdtWordAligned => 4,
        }
    }

    pub fn from_daq_key_byte(key: u8) -> Self {
        match (key >> 6) & 0x03 {
            0 => IdentificationField::AbsoluteOdt,
            1 => IdentificationField::RelativeOdtByte,
            2 => IdentificationField::RelativeOdtWord,
            _ => IdentificationField::RelativeOdtWordAligned,
        }
    }

    /// Decode the identification field of a DAQ packet
    pub fn parse_header(&self, payload: &[u8], byte_order: ByteOrder) -> Result<DtoHeader> {
        let need = self.header_len();
        if payload.len() < need {
            return Err(XcpError::ProtocolViolation(format!(
                "DAQ packet of {} bytes too short for its identification field",
                payload.len()
            )));
        }
        let word = |hi: u8, lo: u8| match byte_order {
            ByteOrder::MsbFirst => u16::from_be_bytes([hi, lo]),
            ByteOrder::MsbLast => u16::from_le_bytes([hi, lo]),
        };
        Ok(match self {
            IdentificationField::AbsoluteOdt => DtoHeader {
                odt: payload[0],
                daq_list: None,
                data_start: 1,
            },
            IdentificationField::RelativeOdtByte => DtoHeader {
                odt: payload[0],
                daq_list: Some(payload[1] as u16),
                data_start: 2,
            },
            IdentificationField::RelativeOdtWord => DtoHeader {
                odt: payload[0],
                daq_list: Some(word(payload[1], payload[2])),
                data_start: 3,
            },
            IdentificationField::RelativeOdtWordAligned => DtoHeader {
                odt: payload[0],
                daq_list: Some(word(payload[2], payload[3])),
                data_start: 4,
            },
        })
    }
}

/// DAQ processor capabilities from GET_DAQ_PROCESSOR_INFO
#[derive(Debug, Clone)]
pub struct DaqProcessorInfo {
    /// Dynamic DAQ list allocation supported (bit 0 of the properties)
    pub dynamic_config: bool,
    pub max_daq: u16,
    pub max_event_channel: u16,
    pub min_daq: u8,
    pub identification_field: IdentificationField,
}

impl DaqProcessorInfo {
    pub fn parse(data: &[u8], byte_order: ByteOrder) -> Result<Self> {
        let mut reader = PacketReader::new(data, byte_order);
        let properties = reader.u8()?;
        let max_daq = reader.u16()?;
        let max_event_channel = reader.u16()?;
        let min_daq = reader.u8()?;
        let daq_key_byte = reader.u8()?;
        Ok(Self {
            dynamic_config: properties & 0x01 != 0,
            max_daq,
            max_event_channel,
            min_daq,
            identification_field: IdentificationField::from_daq_key_byte(daq_key_byte),
        })
    }
}

/// ODT entry sizing limits from GET_DAQ_RESOLUTION_INFO
#[derive(Debug, Clone, Copy)]
pub struct DaqResolutionInfo {
    /// Address/size granularity of DAQ ODT entries, in bytes
    pub granularity_odt_entry_size_daq: u8,
    /// Largest single ODT entry, in bytes
    pub max_odt_entry_size_daq: u8,
}

impl DaqResolutionInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(XcpError::ProtocolViolation(format!(
                "GET_DAQ_RESOLUTION_INFO response has {} data bytes",
                data.len()
            )));
        }
        Ok(Self {
            granularity_odt_entry_size_daq: data[0],
            max_odt_entry_size_daq: data[1],
        })
    }
}

/// One event channel from GET_DAQ_EVENT_INFO
#[derive(Debug, Clone)]
pub struct DaqEventInfo {
    pub supports_daq: bool,
    pub supports_stim: bool,
    pub max_daq_list: u8,
    pub name_length: u8,
    pub time_cycle: u8,
    pub time_unit: u8,
    pub priority: u8,
}

impl DaqEventInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(XcpError::ProtocolViolation(format!(
                "GET_DAQ_EVENT_INFO response has {} data bytes, expected 6",
                data.len()
            )));
        }
        Ok(Self {
            supports_daq: data[0] & 0x04 != 0,
            supports_stim: data[0] & 0x08 != 0,
            max_daq_list: data[1],
            name_length: data[2],
            time_cycle: data[3],
            time_unit: data[4],
            priority: data[5],
        })
    }

    /// Human-readable cycle time, e.g. `10ms`; `acyclic` when the cycle is 0
    pub fn cycle_display(&self) -> String {
        if self.time_cycle == 0 {
            return "acyclic".to_string();
        }
        let ns = self.time_cycle as u128 * 10u128.pow(self.time_unit.min(9) as u32);
        if ns % 1_000_000_000 == 0 {
            format!("{}s", ns / 1_000_000_000)
        } else if ns % 1_000_000 == 0 {
            format!("{}ms", ns / 1_000_000)
        } else if ns % 1_000 == 0 {
            format!("{}us", ns / 1_000)
        } else {
            format!("{}ns", ns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_honors_byte_order() {
        let packet = CommandBuilder::new(CC_SHORT_UPLOAD, ByteOrder::MsbLast)
            .u8(4)
            .u8(0)
            .u8(0)
            .u32(0x1234_5678)
            .build();
        assert_eq!(packet, vec![0xF4, 4, 0, 0, 0x78, 0x56, 0x34, 0x12]);

        let packet = CommandBuilder::new(CC_ALLOC_DAQ, ByteOrder::MsbFirst)
            .u8(0)
            .u16(0x0102)
            .build();
        assert_eq!(packet, vec![0xD5, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_check_response_variants() {
        assert_eq!(check_response(&[0xFF, 1, 2], CC_UPLOAD).unwrap(), &[1, 2]);

        let err = check_response(&[0xFE, 0x25], CC_SHORT_UPLOAD).unwrap_err();
        match err {
            XcpError::Slave {
                code,
                name,
                command,
            } => {
                assert_eq!(code, 0x25);
                assert_eq!(name, "ERR_ACCESS_LOCKED");
                assert_eq!(command, CC_SHORT_UPLOAD);
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(matches!(
            check_response(&[0x42], CC_UPLOAD),
            Err(XcpError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_connect_response_parse() {
        // DAQ + CALPAG, little endian, byte granularity, CTO 8, DTO 8
        let props =
            SlaveProperties::parse(&[0x05, 0x00, 8, 8, 0, 0x01, 0x01]).unwrap();
        assert!(props.supports_daq);
        assert!(props.supports_calpag);
        assert!(!props.supports_pgm);
        assert_eq!(props.byte_order, ByteOrder::MsbLast);
        assert_eq!(props.address_granularity, AddressGranularity::Byte);
        assert_eq!(props.max_cto, 8);
        assert_eq!(props.max_dto, 8);

        // Big endian flips the DTO field ordering.
        let props =
            SlaveProperties::parse(&[0x04, 0x01, 8, 0x01, 0x00, 1, 1]).unwrap();
        assert_eq!(props.byte_order, ByteOrder::MsbFirst);
        assert_eq!(props.max_dto, 0x0100);
    }

    #[test]
    fn test_daq_processor_info_identification_modes() {
        for (key, expected) in [
            (0x00, IdentificationField::AbsoluteOdt),
            (0x40, IdentificationField::RelativeOdtByte),
            (0x80, IdentificationField::RelativeOdtWord),
            (0xC0, IdentificationField::RelativeOdtWordAligned),
        ] {
            let data = [0x01, 0, 0, 2, 0, 0, key];
            let info = DaqProcessorInfo::parse(&data[..6], ByteOrder::MsbLast);
            // 6 bytes is one short of the daq key byte
            assert!(info.is_err());
            let info = DaqProcessorInfo::parse(
                &[0x01, 0x00, 0x00, 0x02, 0x00, 0x00, key],
                ByteOrder::MsbLast,
            )
            .unwrap();
            assert!(info.dynamic_config);
            assert_eq!(info.max_event_channel, 2);
            assert_eq!(info.identification_field, expected);
        }
    }

    #[test]
    fn test_dto_header_parsing() {
        let payload = [0x03, 0x01, 0x00, 0xAA];
        let h = IdentificationField::AbsoluteOdt
            .parse_header(&payload, ByteOrder::MsbLast)
            .unwrap();
        assert_eq!((h.odt, h.daq_list, h.data_start), (3, None, 1));

        let h = IdentificationField::RelativeOdtByte
            .parse_header(&payload, ByteOrder::MsbLast)
            .unwrap();
        assert_eq!((h.odt, h.daq_list, h.data_start), (3, Some(1), 2));

        let h = IdentificationField::RelativeOdtWord
            .parse_header(&payload, ByteOrder::MsbLast)
            .unwrap();
        assert_eq!((h.odt, h.daq_list, h.data_start), (3, Some(1), 3));

        let h = IdentificationField::RelativeOdtWordAligned
            .parse_header(&payload, ByteOrder::MsbLast)
            .unwrap();
        assert_eq!((h.odt, h.daq_list, h.data_start), (3, Some(0xAA00), 4));
    }

    #[test]
    fn test_event_cycle_display() {
        let info = DaqEventInfo {
            supports_daq: true,
            supports_stim: false,
            max_daq_list: 1,
            name_length: 4,
            time_cycle: 10,
            time_unit: 6, // 1 ms ticks
            priority: 0,
        };
        assert_eq!(info.cycle_display(), "10ms");

        let acyclic = DaqEventInfo {
            time_cycle: 0,
            ..info
        };
        assert_eq!(acyclic.cycle_display(), "acyclic");
    }
}
