//! In-process XCP slave for the test suite
//!
//! [`MockSlave`] implements [`Link`] and answers commands the way a small
//! byte-granularity ECU would: a flat memory image, dynamic DAQ list
//! allocation, absolute-ODT identification, trivial seed/key protection,
//! and one calibration page per segment. Once started, it emits DAQ
//! packets on its event channels' cycle times, reading live values from
//! the shared memory image so tests can mutate them mid-measurement.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::protocol::{self, seedkey::SeedKeyStrategy};
use crate::transport::framing::{encode_frame, FrameDecoder};
use crate::transport::Link;

/// Behavior knobs for the mock
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Advertise DAQ support in the CONNECT resource byte
    pub supports_daq: bool,
    /// Require a seed/key unlock before DAQ commands succeed
    pub daq_locked: bool,
    /// MAX_CTO advertised at connect
    pub max_cto: u8,
    /// MAX_DTO advertised at connect
    pub max_dto: u16,
    /// Event channels as `(name, cycle_ms)`
    pub events: Vec<(String, u64)>,
    /// Memory image size in bytes
    pub memory_size: usize,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            supports_daq: true,
            daq_locked: false,
            max_cto: 8,
            max_dto: 32,
            events: vec![("10ms".to_string(), 10), ("100ms".to_string(), 100)],
            memory_size: 0x1_0000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MtaSource {
    Memory(u32),
    /// Event-name bytes exposed by GET_DAQ_EVENT_INFO for the follow-up
    /// UPLOAD
    EventName { event: usize, offset: usize },
}

#[derive(Debug, Default, Clone)]
struct MockList {
    event: u16,
    odts: Vec<Vec<(u32, u8)>>,
    first_pid: u8,
    selected: bool,
}

/// Scripted slave: see the module docs
pub struct MockSlave {
    config: MockConfig,
    memory: Arc<Mutex<Vec<u8>>>,
    rx: FrameDecoder,
    tx: VecDeque<u8>,
    seed: [u8; 4],
    daq_locked: bool,
    unlock_total: usize,
    unlock_buf: Vec<u8>,
    mta: MtaSource,
    lists: Vec<MockList>,
    daq_ptr: (u16, u8, u8),
    running: bool,
    next_due: Vec<Instant>,
    cal_page: u8,
}

impl MockSlave {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        let memory = Arc::new(Mutex::new(vec![0u8; config.memory_size]));
        Self {
            daq_locked: config.daq_locked,
            config,
            memory,
            rx: FrameDecoder::new(),
            tx: VecDeque::new(),
            seed: [0x12, 0x34, 0x56, 0x78],
            unlock_total: 0,
            unlock_buf: Vec::new(),
            mta: MtaSource::Memory(0),
            lists: Vec::new(),
            daq_ptr: (0, 0, 0),
            running: false,
            next_due: Vec::new(),
            cal_page: 0,
        }
    }

    /// Shared handle to the memory image, for seeding and live mutation
    pub fn memory_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.memory)
    }

    /// Write bytes into the memory image at `address`
    pub fn poke(&self, address: u32, bytes: &[u8]) {
        let mut memory = self.memory.lock().expect("mock memory poisoned");
        let address = address as usize;
        memory[address..address + bytes.len()].copy_from_slice(bytes);
    }

    fn respond(&mut self, payload: &[u8]) {
        if let Some(frame) = encode_frame(payload) {
            self.tx.extend(frame);
        }
    }

    fn error(&mut self, code: u8) {
        self.respond(&[0xFE, code]);
    }

    fn read_mem(&self, address: u32, len: usize) -> Vec<u8> {
        let memory = self.memory.lock().expect("mock memory poisoned");
        let address = address as usize;
        memory
            .get(address..address + len)
            .map(|s| s.to_vec())
            .unwrap_or_else(|| vec![0; len])
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn handle_command(&mut self, cmd: Vec<u8>) {
        match cmd[0] {
            protocol::CC_CONNECT => {
                let resource = protocol::RESOURCE_CALPAG
                    | if self.config.supports_daq {
                        protocol::RESOURCE_DAQ
                    } else {
                        0
                    };
                let dto = self.config.max_dto.to_le_bytes();
                self.respond(&[
                    0xFF,
                    resource,
                    0x00, // little endian, byte granularity
                    self.config.max_cto,
                    dto[0],
                    dto[1],
                    0x01,
                    0x01,
                ]);
            }
            protocol::CC_DISCONNECT => {
                self.running = false;
                self.respond(&[0xFF]);
            }
            protocol::CC_GET_STATUS => {
                let protection = if self.daq_locked {
                    protocol::RESOURCE_DAQ
                } else {
                    0
                };
                self.respond(&[0xFF, 0x00, protection, 0x00, 0x00, 0x00]);
            }
            protocol::CC_GET_SEED => {
                let mut resp = vec![0xFF, self.seed.len() as u8];
                resp.extend_from_slice(&self.seed);
                self.respond(&resp);
            }
            protocol::CC_UNLOCK => {
                if self.unlock_buf.is_empty() {
                    self.unlock_total = cmd[1] as usize;
                }
                self.unlock_buf.extend_from_slice(&cmd[2..]);
                if self.unlock_buf.len() >= self.unlock_total {
                    let expected = crate::protocol::seedkey::TrivialSeedKey
                        .compute_key(protocol::RESOURCE_DAQ, &self.seed)
                        .expect("trivial key");
                    if self.unlock_buf[..self.unlock_total] == expected[..] {
                        self.daq_locked = false;
                        self.unlock_buf.clear();
                        self.respond(&[0xFF, 0x00]);
                    } else {
                        self.unlock_buf.clear();
                        self.error(0x25); // ERR_ACCESS_LOCKED
                    }
                } else {
                    let protection = protocol::RESOURCE_DAQ;
                    self.respond(&[0xFF, protection]);
                }
            }
            protocol::CC_SET_MTA => {
                self.mta = MtaSource::Memory(Self::u32_at(&cmd, 4));
                self.respond(&[0xFF]);
            }
            protocol::CC_UPLOAD => {
                let len = cmd[1] as usize;
                let data = match self.mta {
                    MtaSource::Memory(addr) => {
                        self.mta = MtaSource::Memory(addr + len as u32);
                        self.read_mem(addr, len)
                    }
                    MtaSource::EventName { event, offset } => {
                        let name = self.config.events[event].0.as_bytes();
                        let end = (offset + len).min(name.len());
                        let mut data = name[offset.min(name.len())..end].to_vec();
                        data.resize(len, 0);
                        self.mta = MtaSource::EventName {
                            event,
                            offset: offset + len,
                        };
                        data
                    }
                };
                let mut resp = vec![0xFF];
                resp.extend_from_slice(&data);
                self.respond(&resp);
            }
            protocol::CC_SHORT_UPLOAD => {
                let len = cmd[1] as usize;
                let addr = Self::u32_at(&cmd, 4);
                let data = self.read_mem(addr, len);
                let mut resp = vec![0xFF];
                resp.extend_from_slice(&data);
                self.respond(&resp);
            }
            protocol::CC_DOWNLOAD => {
                let len = cmd[1] as usize;
                match self.mta {
                    MtaSource::Memory(addr) => {
                        {
                            let mut memory = self.memory.lock().expect("mock memory poisoned");
                            let at = addr as usize;
                            memory[at..at + len].copy_from_slice(&cmd[2..2 + len]);
                        }
                        self.mta = MtaSource::Memory(addr + len as u32);
                        self.respond(&[0xFF]);
                    }
                    MtaSource::EventName { .. } => self.error(0x22),
                }
            }
            protocol::CC_SET_CAL_PAGE => {
                self.cal_page = cmd[3];
                self.respond(&[0xFF]);
            }
            protocol::CC_GET_CAL_PAGE => {
                self.respond(&[0xFF, 0x00, 0x00, self.cal_page]);
            }
            protocol::CC_GET_DAQ_PROCESSOR_INFO => {
                if self.daq_locked {
                    return self.error(0x25);
                }
                let max_event = (self.config.events.len() as u16).to_le_bytes();
                self.respond(&[
                    0xFF, 0x01, // dynamic configuration
                    0x08, 0x00, // MAX_DAQ
                    max_event[0], max_event[1], 0x00, // MIN_DAQ
                    0x00, // absolute ODT identification
                ]);
            }
            protocol::CC_GET_DAQ_RESOLUTION_INFO => {
                self.respond(&[0xFF, 0x01, 0x1F, 0x01, 0x1F, 0x00, 0x00, 0x00]);
            }
            protocol::CC_GET_DAQ_EVENT_INFO => {
                let event = Self::u16_at(&cmd, 2) as usize;
                if event >= self.config.events.len() {
                    return self.error(0x22);
                }
                let (name, cycle_ms) = &self.config.events[event];
                self.mta = MtaSource::EventName { event, offset: 0 };
                self.respond(&[
                    0xFF,
                    0x04, // DAQ direction
                    0x01,
                    name.len() as u8,
                    *cycle_ms as u8,
                    0x06, // 1 ms time unit
                    0x00,
                ]);
            }
            protocol::CC_FREE_DAQ => {
                if self.daq_locked {
                    return self.error(0x25);
                }
                self.lists.clear();
                self.running = false;
                self.respond(&[0xFF]);
            }
            protocol::CC_ALLOC_DAQ => {
                let count = Self::u16_at(&cmd, 2) as usize;
                self.lists = vec![MockList::default(); count];
                self.respond(&[0xFF]);
            }
            protocol::CC_ALLOC_ODT => {
                let daq = Self::u16_at(&cmd, 2) as usize;
                let count = cmd[4] as usize;
                match self.lists.get_mut(daq) {
                    Some(list) => {
                        list.odts = vec![Vec::new(); count];
                        self.respond(&[0xFF]);
                    }
                    None => self.error(0x2A),
                }
            }
            protocol::CC_ALLOC_ODT_ENTRY => {
                let daq = Self::u16_at(&cmd, 2) as usize;
                let odt = cmd[4] as usize;
                let count = cmd[5] as usize;
                match self.lists.get_mut(daq).and_then(|l| l.odts.get_mut(odt)) {
                    Some(entries) => {
                        entries.reserve(count);
                        self.respond(&[0xFF]);
                    }
                    None => self.error(0x2A),
                }
            }
            protocol::CC_SET_DAQ_PTR => {
                self.daq_ptr = (Self::u16_at(&cmd, 2), cmd[4], cmd[5]);
                self.respond(&[0xFF]);
            }
            protocol::CC_WRITE_DAQ => {
                let (daq, odt, _entry) = self.daq_ptr;
                let size = cmd[2];
                let addr = Self::u32_at(&cmd, 4);
                match self
                    .lists
                    .get_mut(daq as usize)
                    .and_then(|l| l.odts.get_mut(odt as usize))
                {
                    Some(entries) => {
                        entries.push((addr, size));
                        self.daq_ptr.2 += 1;
                        self.respond(&[0xFF]);
                    }
                    None => self.error(0x2A),
                }
            }
            protocol::CC_SET_DAQ_LIST_MODE => {
                let daq = Self::u16_at(&cmd, 2) as usize;
                let event = Self::u16_at(&cmd, 4);
                match self.lists.get_mut(daq) {
                    Some(list) => {
                        list.event = event;
                        self.respond(&[0xFF]);
                    }
                    None => self.error(0x2A),
                }
            }
            protocol::CC_START_STOP_DAQ_LIST => {
                let mode = cmd[1];
                let daq = Self::u16_at(&cmd, 2) as usize;
                // PIDs run sequentially across lists in index order.
                let first_pid: u8 = self
                    .lists
                    .iter()
                    .take(daq)
                    .map(|l| l.odts.len() as u8)
                    .sum();
                match self.lists.get_mut(daq) {
                    Some(list) if mode == 2 => {
                        list.selected = true;
                        list.first_pid = first_pid;
                        self.respond(&[0xFF, first_pid]);
                    }
                    Some(list) => {
                        list.selected = mode == 1;
                        self.respond(&[0xFF, first_pid]);
                    }
                    None => self.error(0x2A),
                }
            }
            protocol::CC_START_STOP_SYNCH => {
                let start = cmd[1] == 1;
                self.running = start;
                if start {
                    let now = Instant::now();
                    self.next_due = self
                        .lists
                        .iter()
                        .map(|l| now + self.cycle_of(l.event))
                        .collect();
                } else {
                    for list in &mut self.lists {
                        list.selected = false;
                    }
                }
                self.respond(&[0xFF]);
            }
            _ => self.error(0x20), // ERR_CMD_UNKNOWN
        }
    }

    fn cycle_of(&self, event: u16) -> Duration {
        self.config
            .events
            .get(event as usize)
            .map(|(_, ms)| Duration::from_millis(*ms))
            .unwrap_or(Duration::from_millis(100))
    }

    /// Emit due DAQ packets for every selected list
    fn pump_daq(&mut self) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        for i in 0..self.lists.len() {
            if !self.lists[i].selected {
                continue;
            }
            let cycle = self.cycle_of(self.lists[i].event);
            while self.next_due[i] <= now {
                self.next_due[i] += cycle;
                let list = self.lists[i].clone();
                for (j, odt) in list.odts.iter().enumerate() {
                    let mut payload = vec![list.first_pid + j as u8];
                    for &(addr, size) in odt {
                        payload.extend(self.read_mem(addr, size as usize));
                    }
                    self.respond(&payload);
                }
            }
        }
    }
}

impl Default for MockSlave {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for MockSlave {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.tx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.rx.push_bytes(buf);
        while let Some(cmd) = self.rx.next_frame() {
            if !cmd.is_empty() {
                self.handle_command(cmd);
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        self.pump_daq();
        Ok(self.tx.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(slave: &mut MockSlave, cmd: &[u8]) -> Vec<u8> {
        slave
            .write_all(&encode_frame(cmd).unwrap())
            .expect("write");
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 128];
        let n = slave.read(&mut buf).expect("read");
        decoder.push_bytes(&buf[..n]);
        decoder.next_frame().expect("response frame")
    }

    #[test]
    fn test_connect_and_short_upload() {
        let mut slave = MockSlave::new();
        slave.poke(0x100, &[0xAA, 0xBB]);

        let resp = roundtrip(&mut slave, &[protocol::CC_CONNECT, 0x00]);
        assert_eq!(resp[0], 0xFF);
        assert_eq!(resp[1] & protocol::RESOURCE_DAQ, protocol::RESOURCE_DAQ);

        let resp = roundtrip(
            &mut slave,
            &[protocol::CC_SHORT_UPLOAD, 2, 0, 0, 0x00, 0x01, 0, 0],
        );
        assert_eq!(resp, vec![0xFF, 0xAA, 0xBB]);
    }

    #[test]
    fn test_locked_daq_requires_unlock() {
        let mut slave = MockSlave::with_config(MockConfig {
            daq_locked: true,
            ..MockConfig::default()
        });
        let resp = roundtrip(&mut slave, &[protocol::CC_FREE_DAQ]);
        assert_eq!(resp, vec![0xFE, 0x25]);

        let seed = roundtrip(&mut slave, &[protocol::CC_GET_SEED, 0, 0x04]);
        assert_eq!(seed[1], 4);
        // Key = first 4 seed bytes + 5 zeros, sent in two chunks of <= 6.
        let key = [0x12, 0x34, 0x56, 0x78, 0, 0, 0, 0, 0];
        let mut first = vec![protocol::CC_UNLOCK, 9];
        first.extend_from_slice(&key[..6]);
        roundtrip(&mut slave, &first);
        let mut second = vec![protocol::CC_UNLOCK, 3];
        second.extend_from_slice(&key[6..]);
        let resp = roundtrip(&mut slave, &second);
        assert_eq!(resp, vec![0xFF, 0x00]);

        let resp = roundtrip(&mut slave, &[protocol::CC_FREE_DAQ]);
        assert_eq!(resp, vec![0xFF]);
    }

    #[test]
    fn test_event_name_exposed_via_upload() {
        let mut slave = MockSlave::new();
        let info = roundtrip(&mut slave, &[protocol::CC_GET_DAQ_EVENT_INFO, 0, 0, 0]);
        let name_len = info[3];
        assert_eq!(name_len, 4);
        let name = roundtrip(&mut slave, &[protocol::CC_UPLOAD, name_len]);
        assert_eq!(&name[1..], b"10ms");
    }
}
