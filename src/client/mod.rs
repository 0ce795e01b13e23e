//! XCP session and measurement client
//!
//! [`XcpClient`] drives one slave through its lifecycle: connect and
//! capability negotiation, measurement setup (bin packing plus DAQ list
//! allocation), concurrent acquisition (a DAQ decode thread and one
//! polling thread per interval group), and chunked calibration reads and
//! writes. Samples and lifecycle notifications are published as
//! [`ClientEvent`]s to every subscriber; background threads never panic
//! outward, they funnel problems through the same bus.
//!
//! All commands share one request mutex, so calibration access stays safe
//! while polling loops are running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::codec;
use crate::context::CalContext;
use crate::daq::builder::{write_daq_lists, CommandPort};
use crate::daq::packer::{pack, PackItem};
use crate::daq::{DaqList, Odt, OdtEntry};
use crate::database::{size_of, SymbolRef};
use crate::error::{Result, ResultExt, XcpError};
use crate::protocol::{
    check_response, seedkey::SeedKeyStrategy, seedkey::TrivialSeedKey, AddressGranularity,
    CommandBuilder, DaqEventInfo, DaqProcessorInfo, DaqResolutionInfo, IdentificationField,
    ProtectionStatus, SlaveProperties, CC_CONNECT, CC_DISCONNECT, CC_DOWNLOAD, CC_GET_CAL_PAGE,
    CC_GET_DAQ_EVENT_INFO, CC_GET_DAQ_PROCESSOR_INFO, CC_GET_DAQ_RESOLUTION_INFO, CC_GET_SEED,
    CC_GET_STATUS, CC_SET_CAL_PAGE, CC_SET_MTA, CC_SHORT_UPLOAD, CC_START_STOP_DAQ_LIST,
    CC_START_STOP_SYNCH, CC_UNLOCK, CC_UPLOAD, DEFAULT_TIMEOUT, RESOURCE_CALPAG, RESOURCE_DAQ,
};
use crate::transport::{FrameTransport, Link, TimedFrame};
use crate::types::{
    AcquisitionChannel, ByteOrder, ConnectionState, Sample, SignalConfig, Value,
};

/// How long `stop_measurement` waits for each loop thread before detaching
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Notifications published to subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A decoded measurement sample
    Data(Sample),
    /// A background failure that did not stop the acquisition
    Error(String),
    MeasurementStarted,
    MeasurementStopped,
}

/// Established transport plus negotiated capabilities
///
/// Shared between the client and its acquisition threads; the internal
/// mutex serializes command/response exchanges.
struct Session {
    transport: FrameTransport,
    lock: Mutex<()>,
    properties: SlaveProperties,
}

impl Session {
    /// Send one command and return the checked positive-response data
    fn execute(&self, packet: Vec<u8>) -> Result<Vec<u8>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| XcpError::Link("request mutex poisoned".into()))?;
        let frame = self.transport.request(&packet, DEFAULT_TIMEOUT)?;
        check_response(&frame.payload, packet[0]).map(|data| data.to_vec())
    }

    fn max_cto(&self) -> usize {
        self.properties.max_cto as usize
    }

    /// Largest per-command payload respecting the address granularity
    fn upload_chunk(&self) -> usize {
        let gran = self.properties.address_granularity.bytes() as usize;
        ((self.max_cto() - 1) / gran) * gran
    }

    /// Read `size` bytes starting at `address`
    ///
    /// Small objects go through a single SHORT_UPLOAD; larger ones are
    /// fetched with SET_MTA and a chunked UPLOAD loop.
    fn upload_bytes(&self, address: u64, size: u32) -> Result<Vec<u8>> {
        let bo = self.properties.byte_order;
        let address32 = narrow_address(address)?;
        let size = size as usize;
        if size <= self.upload_chunk() {
            let data = self.execute(
                CommandBuilder::new(CC_SHORT_UPLOAD, bo)
                    .u8(size as u8)
                    .u8(0)
                    .u8(0) // address extension
                    .u32(address32)
                    .build(),
            )?;
            return take_exact(data, size);
        }

        self.execute(
            CommandBuilder::new(CC_SET_MTA, bo)
                .u8(0)
                .u8(0)
                .u8(0)
                .u32(address32)
                .build(),
        )?;
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let n = (size - out.len()).min(self.upload_chunk());
            let data = self.execute(CommandBuilder::new(CC_UPLOAD, bo).u8(n as u8).build())?;
            out.extend(take_exact(data, n)?);
        }
        Ok(out)
    }

    /// Write `bytes` starting at `address`, chunked to fit the CTO
    fn download_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let bo = self.properties.byte_order;
        self.execute(
            CommandBuilder::new(CC_SET_MTA, bo)
                .u8(0)
                .u8(0)
                .u8(0)
                .u32(narrow_address(address)?)
                .build(),
        )?;
        // DOWNLOAD carries the command byte plus a length byte.
        let chunk = self.max_cto() - 2;
        for part in bytes.chunks(chunk) {
            self.execute(
                CommandBuilder::new(CC_DOWNLOAD, bo)
                    .u8(part.len() as u8)
                    .bytes(part)
                    .build(),
            )?;
        }
        Ok(())
    }
}

impl CommandPort for Session {
    fn byte_order(&self) -> ByteOrder {
        self.properties.byte_order
    }

    fn execute(&self, packet: Vec<u8>) -> Result<Vec<u8>> {
        Session::execute(self, packet)
    }
}

fn narrow_address(address: u64) -> Result<u32> {
    u32::try_from(address).map_err(|_| {
        XcpError::ProtocolViolation(format!(
            "address 0x{:X} exceeds the 32-bit command range",
            address
        ))
    })
}

fn take_exact(mut data: Vec<u8>, n: usize) -> Result<Vec<u8>> {
    if data.len() < n {
        return Err(XcpError::ProtocolViolation(format!(
            "upload returned {} bytes, expected {}",
            data.len(),
            n
        )));
    }
    data.truncate(n);
    Ok(data)
}

/// Signals polled together at one interval
#[derive(Debug, Clone)]
struct PollGroup {
    interval: Duration,
    identifiers: Vec<String>,
}

type Subscribers = Arc<Mutex<Vec<Sender<ClientEvent>>>>;

fn publish(subscribers: &Subscribers, event: ClientEvent) {
    let mut subs = match subscribers.lock() {
        Ok(subs) => subs,
        Err(_) => return,
    };
    subs.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Calibration and measurement client for one slave
pub struct XcpClient {
    context: Arc<CalContext>,
    seed_key: Box<dyn SeedKeyStrategy>,
    session: Option<Arc<Session>>,
    daq_rx: Option<Receiver<TimedFrame>>,
    daq_info: Option<DaqProcessorInfo>,
    resolution: Option<DaqResolutionInfo>,
    event_channels: Vec<(String, DaqEventInfo)>,
    daq_lists: Vec<DaqList>,
    poll_groups: Vec<PollGroup>,
    subscribers: Subscribers,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    state: ConnectionState,
}

impl XcpClient {
    pub fn new(context: Arc<CalContext>) -> Self {
        Self {
            context,
            seed_key: Box::new(TrivialSeedKey),
            session: None,
            daq_rx: None,
            daq_info: None,
            resolution: None,
            event_channels: Vec::new(),
            daq_lists: Vec::new(),
            poll_groups: Vec::new(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            state: ConnectionState::Disconnected,
        }
    }

    /// Replace the seed/key strategy before connecting
    pub fn with_seed_key(mut self, strategy: Box<dyn SeedKeyStrategy>) -> Self {
        self.seed_key = strategy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Receive a stream of [`ClientEvent`]s
    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Establish a session over `link`
    ///
    /// On any failure the transport is torn down completely before the
    /// error surfaces; the client is reusable afterwards.
    pub fn connect(&mut self, link: Box<dyn Link>) -> Result<()> {
        self.state = ConnectionState::Connecting;
        match self.try_connect(link) {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                tracing::info!("session established");
                Ok(())
            }
            Err(e) => {
                if let Some(session) = self.session.take() {
                    let bo = session.properties.byte_order;
                    let _ = session.execute(CommandBuilder::new(CC_DISCONNECT, bo).build());
                }
                self.daq_rx = None;
                self.state = ConnectionState::Disconnected;
                Err(e).context("connect failed")
            }
        }
    }

    fn try_connect(&mut self, link: Box<dyn Link>) -> Result<()> {
        let mut transport = FrameTransport::start(link)?;
        let daq_rx = transport
            .take_daq_receiver()
            .ok_or_else(|| XcpError::Link("transport already consumed".into()))?;

        // Byte order is unknown until CONNECT answers; the packet itself
        // has no multi-byte fields.
        let frame = transport.request(&[CC_CONNECT, 0x00], DEFAULT_TIMEOUT)?;
        let data = check_response(&frame.payload, CC_CONNECT)?;
        let properties = SlaveProperties::parse(data)?;
        tracing::debug!(?properties, "connected");

        if properties.address_granularity != AddressGranularity::Byte {
            return Err(XcpError::UnsupportedDevice(
                "only byte address granularity is supported".into(),
            ));
        }
        if !properties.supports_daq {
            return Err(XcpError::UnsupportedDevice(
                "slave does not support DAQ measurements".into(),
            ));
        }
        // The protocol mandates MAX_CTO >= 8; anything below starves the
        // chunk math in the upload/download paths.
        if properties.max_cto < 8 {
            return Err(XcpError::ProtocolViolation(format!(
                "negotiated MAX_CTO {} is below the protocol minimum of 8",
                properties.max_cto
            )));
        }

        let session = Arc::new(Session {
            transport,
            lock: Mutex::new(()),
            properties,
        });
        self.session = Some(Arc::clone(&session));
        self.daq_rx = Some(daq_rx);

        let bo = session.properties.byte_order;
        let status = ProtectionStatus::parse(&session.execute(
            CommandBuilder::new(CC_GET_STATUS, bo).build(),
        )?)?;
        if status.daq_locked {
            self.unlock(RESOURCE_DAQ).context("unlock daq")?;
        }
        if status.calpag_locked && session.properties.supports_calpag {
            self.unlock(RESOURCE_CALPAG).context("unlock calpag")?;
        }

        let daq_info = DaqProcessorInfo::parse(
            &session.execute(CommandBuilder::new(CC_GET_DAQ_PROCESSOR_INFO, bo).build())?,
            bo,
        )?;
        if !daq_info.dynamic_config {
            return Err(XcpError::ProtocolViolation(
                "slave offers only static DAQ lists".into(),
            ));
        }
        let resolution = DaqResolutionInfo::parse(
            &session.execute(CommandBuilder::new(CC_GET_DAQ_RESOLUTION_INFO, bo).build())?,
        )?;

        let mut event_channels = Vec::new();
        for event in 0..daq_info.max_event_channel {
            let info = DaqEventInfo::parse(&session.execute(
                CommandBuilder::new(CC_GET_DAQ_EVENT_INFO, bo)
                    .u8(0)
                    .u16(event)
                    .build(),
            )?)?;
            let name = self.read_event_name(&session, info.name_length)?;
            tracing::debug!(event, name = %name, cycle = %info.cycle_display(), "event channel");
            event_channels.push((name, info));
        }

        self.daq_info = Some(daq_info);
        self.resolution = Some(resolution);
        self.event_channels = event_channels;
        Ok(())
    }

    /// Read an event channel name left at the slave's transfer address by
    /// GET_DAQ_EVENT_INFO
    fn read_event_name(&self, session: &Session, length: u8) -> Result<String> {
        let bo = session.properties.byte_order;
        let mut raw = Vec::with_capacity(length as usize);
        while raw.len() < length as usize {
            let n = (length as usize - raw.len()).min(session.upload_chunk());
            let data = session.execute(CommandBuilder::new(CC_UPLOAD, bo).u8(n as u8).build())?;
            raw.extend(take_exact(data, n)?);
        }
        Ok(raw
            .into_iter()
            .take_while(|&b| b != 0)
            .map(|b| b as char)
            .collect())
    }

    fn unlock(&self, resource: u8) -> Result<()> {
        let session = self.session()?;
        let bo = session.properties.byte_order;

        let data = session.execute(
            CommandBuilder::new(CC_GET_SEED, bo).u8(0).u8(resource).build(),
        )?;
        let total = *data.first().ok_or_else(|| {
            XcpError::ProtocolViolation("GET_SEED response missing length".into())
        })? as usize;
        let mut seed = data[1..].to_vec();
        while seed.len() < total {
            let data = session.execute(
                CommandBuilder::new(CC_GET_SEED, bo).u8(1).u8(resource).build(),
            )?;
            if data.len() <= 1 {
                return Err(XcpError::ProtocolViolation(
                    "GET_SEED remainder came back empty".into(),
                ));
            }
            seed.extend_from_slice(&data[1..]);
        }
        seed.truncate(total);

        let key = self.seed_key.compute_key(resource, &seed)?;
        let chunk = session.max_cto() - 2;
        let mut remaining = key.len();
        for part in key.chunks(chunk) {
            session.execute(
                CommandBuilder::new(CC_UNLOCK, bo)
                    .u8(remaining as u8)
                    .bytes(part)
                    .build(),
            )?;
            remaining -= part.len();
        }
        tracing::info!(resource, "resource unlocked");
        Ok(())
    }

    /// Close the session; stops any running measurement first
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Measuring {
            if let Err(e) = self.stop_measurement() {
                tracing::warn!(error = %e, "stop during disconnect failed");
            }
        }
        if let Some(session) = self.session.take() {
            let bo = session.properties.byte_order;
            if let Err(e) = session.execute(CommandBuilder::new(CC_DISCONNECT, bo).build()) {
                tracing::debug!(error = %e, "disconnect command failed");
            }
        }
        self.daq_rx = None;
        self.daq_lists.clear();
        self.poll_groups.clear();
        self.state = ConnectionState::Disconnected;
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| XcpError::Link("not connected".into()))
    }

    /// Event channels by name with a human-readable cycle time
    pub fn get_event_channels(&self) -> HashMap<String, String> {
        self.event_channels
            .iter()
            .map(|(name, info)| (name.clone(), info.cycle_display()))
            .collect()
    }

    /// Partition, validate, pack, and allocate the enabled signals
    ///
    /// Everything is validated locally before the first command touches
    /// the slave, so a rejected setup leaves no half-written DAQ state.
    pub fn setup_measurement(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(XcpError::Setup(format!(
                "cannot set up a measurement while {}",
                self.state
            )));
        }
        let session = Arc::clone(self.session()?);
        let daq_info = self
            .daq_info
            .clone()
            .ok_or_else(|| XcpError::Setup("missing DAQ processor info".into()))?;
        let resolution = self
            .resolution
            .ok_or_else(|| XcpError::Setup("missing DAQ resolution info".into()))?;

        let mut by_interval: HashMap<u64, Vec<String>> = HashMap::new();
        let mut by_channel: HashMap<String, Vec<(String, u64, u32)>> = HashMap::new();

        for config in self.context.enabled_signals() {
            let (_, symbol) = self.context.resolve(&config.identifier)?;
            let size = size_of(&symbol);
            // Every enabled signal honors the slave's entry and granularity
            // limits, polled ones included.
            validate_signal(&config, &symbol, size, &resolution)?;
            match &config.channel {
                AcquisitionChannel::Polling => {
                    by_interval
                        .entry(config.rate_ms.max(1))
                        .or_default()
                        .push(config.identifier.clone());
                }
                AcquisitionChannel::Event(channel) => {
                    let event = self
                        .event_channels
                        .iter()
                        .position(|(name, _)| name == channel)
                        .ok_or_else(|| {
                            XcpError::ProtocolViolation(format!(
                                "'{}' references unknown event channel '{}'",
                                config.identifier, channel
                            ))
                        })?;
                    if !self.event_channels[event].1.supports_daq {
                        return Err(XcpError::ProtocolViolation(format!(
                            "event channel '{}' does not support DAQ",
                            channel
                        )));
                    }
                    by_channel.entry(channel.clone()).or_default().push((
                        config.identifier.clone(),
                        symbol.address(),
                        size,
                    ));
                }
            }
        }

        let capacity = session.properties.max_dto as u32
            - daq_info.identification_field.header_len() as u32;

        let mut lists = Vec::new();
        let mut channels: Vec<_> = by_channel.into_iter().collect();
        channels.sort_by(|a, b| a.0.cmp(&b.0));
        for (channel, signals) in channels {
            let items: Vec<PackItem> = signals
                .iter()
                .map(|(id, _, size)| PackItem::new(id.clone(), *size))
                .collect();
            let addresses: HashMap<&str, u64> = signals
                .iter()
                .map(|(id, addr, _)| (id.as_str(), *addr))
                .collect();
            let bins = pack(&items, capacity)?;
            let odts = bins
                .into_iter()
                .map(|bin| Odt {
                    entries: bin
                        .into_iter()
                        .map(|item| OdtEntry {
                            address: addresses[item.identifier.as_str()],
                            identifier: item.identifier,
                            size: item.size,
                        })
                        .collect(),
                })
                .collect();
            let event_channel = self
                .event_channels
                .iter()
                .position(|(name, _)| name == &channel)
                .unwrap_or(0) as u16;
            let list = DaqList {
                channel,
                event_channel,
                odts,
                first_pid: 0,
            };
            for (odt, table) in list.odts.iter().enumerate() {
                tracing::debug!(
                    channel = %list.channel,
                    odt,
                    bytes = table.payload_size(),
                    entries = table.entries.len(),
                    "ODT packed"
                );
            }
            lists.push(list);
        }

        write_daq_lists(session.as_ref(), &lists)?;

        self.poll_groups = by_interval
            .into_iter()
            .map(|(interval, identifiers)| PollGroup {
                interval: Duration::from_millis(interval),
                identifiers,
            })
            .collect();
        self.daq_lists = lists;
        tracing::info!(
            daq_lists = self.daq_lists.len(),
            poll_groups = self.poll_groups.len(),
            "measurement configured"
        );
        Ok(())
    }

    /// Start the configured measurement and spawn the acquisition loops
    pub fn start_measurement(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(XcpError::Setup(format!(
                "cannot start a measurement while {}",
                self.state
            )));
        }
        if self.daq_lists.is_empty() && self.poll_groups.is_empty() {
            return Err(XcpError::Setup("no signals configured".into()));
        }
        let session = Arc::clone(self.session()?);
        let bo = session.properties.byte_order;

        for (daq, list) in self.daq_lists.iter_mut().enumerate() {
            let data = session.execute(
                CommandBuilder::new(CC_START_STOP_DAQ_LIST, bo)
                    .u8(2) // select
                    .u16(daq as u16)
                    .build(),
            )?;
            list.first_pid = data.first().copied().ok_or_else(|| {
                XcpError::ProtocolViolation("START_STOP_DAQ_LIST returned no first PID".into())
            })?;
        }
        session.execute(CommandBuilder::new(CC_START_STOP_SYNCH, bo).u8(1).build())?;

        self.stop.store(false, Ordering::Relaxed);

        if !self.daq_lists.is_empty() {
            let daq_rx = self
                .daq_rx
                .as_ref()
                .ok_or_else(|| XcpError::Link("DAQ receiver missing".into()))?
                .clone();
            // Flush packets left over from an earlier run.
            while daq_rx.try_recv().is_ok() {}
            let thread = spawn_daq_loop(
                daq_rx,
                self.daq_lists.clone(),
                self.daq_info
                    .as_ref()
                    .map(|i| i.identification_field)
                    .unwrap_or(IdentificationField::AbsoluteOdt),
                bo,
                Arc::clone(&self.context),
                Arc::clone(&self.subscribers),
                Arc::clone(&self.stop),
            )?;
            self.threads.push(thread);
        }

        for group in &self.poll_groups {
            let thread = spawn_poll_loop(
                group.clone(),
                Arc::clone(&session),
                Arc::clone(&self.context),
                Arc::clone(&self.subscribers),
                Arc::clone(&self.stop),
            )?;
            self.threads.push(thread);
        }

        self.state = ConnectionState::Measuring;
        publish(&self.subscribers, ClientEvent::MeasurementStarted);
        tracing::info!("measurement started");
        Ok(())
    }

    /// Stop the acquisition loops and the slave-side transmission
    pub fn stop_measurement(&mut self) -> Result<()> {
        if self.state != ConnectionState::Measuring {
            return Err(XcpError::Setup(format!(
                "no measurement running while {}",
                self.state
            )));
        }
        self.stop.store(true, Ordering::Relaxed);

        let session = Arc::clone(self.session()?);
        let bo = session.properties.byte_order;
        let stop_result =
            session.execute(CommandBuilder::new(CC_START_STOP_SYNCH, bo).u8(0).build());

        for handle in self.threads.drain(..) {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("acquisition thread ignored stop, detaching");
            }
        }

        self.state = ConnectionState::Connected;
        publish(&self.subscribers, ClientEvent::MeasurementStopped);
        tracing::info!("measurement stopped");
        stop_result.map(|_| ())
    }

    /// Read a symbol's current value as `(raw, physical)`
    pub fn upload(&self, identifier: &str) -> Result<(Value, Value)> {
        let session = self.session()?;
        let (_, symbol) = self.context.resolve(identifier)?;
        let bytes = session.upload_bytes(symbol.address(), size_of(&symbol))?;
        codec::decode_symbol(&bytes, &symbol, session.properties.byte_order)
            .with_context(|| format!("decode '{}'", identifier))
    }

    /// Write a physical value to a parameter
    pub fn download(&self, identifier: &str, physical: &Value) -> Result<()> {
        let session = self.session()?;
        let (_, symbol) = self.context.resolve(identifier)?;
        let bytes = codec::encode_symbol(physical, &symbol, session.properties.byte_order)
            .with_context(|| format!("encode '{}'", identifier))?;
        session.download_bytes(symbol.address(), &bytes)
    }

    /// Write raw bytes to an address, limited to a single command
    pub fn download_raw(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let session = self.session()?;
        if bytes.len() > session.max_cto() - 2 {
            return Err(XcpError::Size(format!(
                "raw write of {} bytes exceeds the single-command limit of {}",
                bytes.len(),
                session.max_cto() - 2
            )));
        }
        session.download_bytes(address, bytes)
    }

    /// Active calibration page of segment 0
    pub fn get_cal_page(&self) -> Result<u8> {
        let session = self.session()?;
        let bo = session.properties.byte_order;
        let data = session.execute(
            CommandBuilder::new(CC_GET_CAL_PAGE, bo)
                .u8(0x83) // same ECU + XCP access mode as the setter
                .u8(0)
                .build(),
        )?;
        data.get(2).copied().ok_or_else(|| {
            XcpError::ProtocolViolation("GET_CAL_PAGE response too short".into())
        })
    }

    /// Switch the active calibration page for ECU and tool access
    pub fn set_cal_page(&self, page: u8) -> Result<()> {
        let session = self.session()?;
        let bo = session.properties.byte_order;
        session
            .execute(
                CommandBuilder::new(CC_SET_CAL_PAGE, bo)
                    .u8(0x83) // ECU + XCP access, all segments
                    .u8(0)
                    .u8(page)
                    .build(),
            )
            .map(|_| ())
    }
}

impl Drop for XcpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn validate_signal(
    config: &SignalConfig,
    symbol: &SymbolRef<'_>,
    size: u32,
    resolution: &DaqResolutionInfo,
) -> Result<()> {
    if size > resolution.max_odt_entry_size_daq as u32 {
        return Err(XcpError::Size(format!(
            "'{}' ({} bytes) exceeds the ODT entry limit of {}",
            config.identifier, size, resolution.max_odt_entry_size_daq
        )));
    }
    let gran = resolution.granularity_odt_entry_size_daq.max(1) as u64;
    if symbol.address() % gran != 0 || size as u64 % gran != 0 {
        return Err(XcpError::Granularity(format!(
            "'{}' at 0x{:X} with {} bytes violates the {}-byte granularity",
            config.identifier,
            symbol.address(),
            size,
            gran
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_daq_loop(
    daq_rx: Receiver<TimedFrame>,
    lists: Vec<DaqList>,
    id_field: IdentificationField,
    byte_order: ByteOrder,
    context: Arc<CalContext>,
    subscribers: Subscribers,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("xcp-daq-decode".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let frame = match daq_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(frame) => frame,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                };
                if let Err(e) =
                    decode_daq_frame(&frame, &lists, id_field, byte_order, &context, &subscribers)
                {
                    tracing::debug!(error = %e, "DAQ packet dropped");
                    publish(&subscribers, ClientEvent::Error(e.to_string()));
                }
            }
        })
        .map_err(|e| XcpError::Link(format!("failed to spawn DAQ loop: {}", e)))
}

/// Decode one DAQ packet into samples, published in entry order
fn decode_daq_frame(
    frame: &TimedFrame,
    lists: &[DaqList],
    id_field: IdentificationField,
    byte_order: ByteOrder,
    context: &CalContext,
    subscribers: &Subscribers,
) -> Result<()> {
    let header = id_field.parse_header(&frame.payload, byte_order)?;
    let odt = match header.daq_list {
        Some(daq) => lists
            .get(daq as usize)
            .and_then(|l| l.odts.get(header.odt as usize)),
        // Absolute mode: locate the list owning this PID.
        None => lists.iter().find_map(|l| {
            let rel = header.odt.checked_sub(l.first_pid)?;
            l.odts.get(rel as usize)
        }),
    }
    .ok_or_else(|| {
        XcpError::ProtocolViolation(format!("DAQ packet for unknown ODT {}", header.odt))
    })?;

    let mut offset = header.data_start;
    for entry in &odt.entries {
        let end = offset + entry.size as usize;
        let bytes = frame.payload.get(offset..end).ok_or_else(|| {
            XcpError::ProtocolViolation(format!(
                "DAQ packet truncated at '{}' ({} of {} bytes)",
                entry.identifier,
                frame.payload.len(),
                end
            ))
        })?;
        offset = end;

        match context
            .resolve(&entry.identifier)
            .and_then(|(_, symbol)| codec::decode_symbol(bytes, &symbol, byte_order))
        {
            Ok((raw, physical)) => publish(
                subscribers,
                ClientEvent::Data(Sample {
                    identifier: entry.identifier.clone(),
                    raw,
                    physical,
                    timestamp: frame.timestamp,
                }),
            ),
            Err(e) => {
                tracing::debug!(identifier = %entry.identifier, error = %e, "sample dropped");
            }
        }
    }
    Ok(())
}

fn spawn_poll_loop(
    group: PollGroup,
    session: Arc<Session>,
    context: Arc<CalContext>,
    subscribers: Subscribers,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("xcp-poll-{}ms", group.interval.as_millis()))
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for identifier in &group.identifiers {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match poll_one(identifier, &session, &context) {
                        Ok(sample) => publish(&subscribers, ClientEvent::Data(sample)),
                        Err(e) if e.is_transient() => {
                            // One missed sample; the next round retries.
                            tracing::debug!(identifier = %identifier, error = %e, "poll missed");
                        }
                        Err(e) => {
                            publish(&subscribers, ClientEvent::Error(e.to_string()));
                        }
                    }
                }
                std::thread::sleep(group.interval);
            }
        })
        .map_err(|e| XcpError::Link(format!("failed to spawn poll loop: {}", e)))
}

fn poll_one(identifier: &str, session: &Session, context: &CalContext) -> Result<Sample> {
    let (_, symbol) = context.resolve(identifier)?;
    let bytes = session.upload_bytes(symbol.address(), size_of(&symbol))?;
    let (raw, physical) =
        codec::decode_symbol(&bytes, &symbol, session.properties.byte_order)?;
    Ok(Sample {
        identifier: identifier.to_string(),
        raw,
        physical,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::protocol::DtoHeader;

    fn resolution(gran: u8, max: u8) -> DaqResolutionInfo {
        DaqResolutionInfo {
            granularity_odt_entry_size_daq: gran,
            max_odt_entry_size_daq: max,
        }
    }

    fn symbol_db() -> Database {
        Database::from_json(
            r#"{
                "name": "d",
                "signals": [
                    { "name": "ok", "address": "0x1000", "datatype": "ULONG" },
                    { "name": "odd", "address": "0x1001", "datatype": "ULONG" }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_granularity_validation() {
        let db = symbol_db();
        let config = SignalConfig::daq("d/ok", "10ms");

        let sym = db.find("ok").unwrap();
        assert!(validate_signal(&config, &sym, 4, &resolution(4, 8)).is_ok());

        let sym = db.find("odd").unwrap();
        let err = validate_signal(&config, &sym, 4, &resolution(4, 8)).unwrap_err();
        assert!(matches!(err, XcpError::Granularity(_)));
    }

    #[test]
    fn test_size_validation() {
        let db = symbol_db();
        let config = SignalConfig::daq("d/ok", "10ms");
        let sym = db.find("ok").unwrap();
        let err = validate_signal(&config, &sym, 4, &resolution(1, 2)).unwrap_err();
        assert!(matches!(err, XcpError::Size(_)));
    }

    #[test]
    fn test_absolute_pid_dispatch() {
        let lists = vec![
            DaqList {
                channel: "10ms".into(),
                event_channel: 0,
                odts: vec![Odt::default(), Odt::default()],
                first_pid: 0,
            },
            DaqList {
                channel: "100ms".into(),
                event_channel: 1,
                odts: vec![Odt {
                    entries: vec![OdtEntry {
                        identifier: "d/ok".into(),
                        address: 0x1000,
                        size: 4,
                    }],
                }],
                first_pid: 2,
            },
        ];
        // PID 2 must land in the second list's first ODT.
        let header = DtoHeader {
            odt: 2,
            daq_list: None,
            data_start: 1,
        };
        let odt = lists
            .iter()
            .find_map(|l| {
                let rel = header.odt.checked_sub(l.first_pid)?;
                l.odts.get(rel as usize)
            })
            .unwrap();
        assert_eq!(odt.entries[0].identifier, "d/ok");
    }
}
