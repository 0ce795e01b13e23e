//! End-to-end lifecycle tests against the in-process mock slave

mod common;

use std::sync::Arc;
use std::time::Duration;

use xcpcal_rs::transport::mock::{MockConfig, MockSlave};
use xcpcal_rs::types::ConnectionState;
use xcpcal_rs::{CalContext, ClientEvent, Database, SignalConfig, Value, XcpClient, XcpError};

use common::rig_context;

fn drain_samples(
    events: &crossbeam_channel::Receiver<ClientEvent>,
    identifier: &str,
) -> Vec<xcpcal_rs::Sample> {
    let mut samples = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Data(sample) = event {
            if sample.identifier == identifier {
                samples.push(sample);
            }
        }
    }
    samples
}

#[test]
fn polling_measurement_yields_periodic_samples() {
    let context = rig_context();
    context.set_signal_config(SignalConfig::polling("rig/speed").with_rate_ms(100));

    let slave = MockSlave::new();
    slave.poke(0x1000, &21u16.to_le_bytes());

    let mut client = XcpClient::new(context);
    client.connect(Box::new(slave)).expect("connect");
    let events = client.subscribe();

    client.setup_measurement().expect("setup");
    client.start_measurement().expect("start");
    assert_eq!(client.state(), ConnectionState::Measuring);

    std::thread::sleep(Duration::from_millis(350));
    client.stop_measurement().expect("stop");
    assert_eq!(client.state(), ConnectionState::Connected);

    let samples = drain_samples(&events, "rig/speed");
    // One sample per 100 ms round over 350 ms, first one immediate.
    assert!(
        (3..=4).contains(&samples.len()),
        "expected 3-4 samples, got {}",
        samples.len()
    );
    for pair in samples.windows(2) {
        assert!(
            pair[1].timestamp > pair[0].timestamp,
            "timestamps must be strictly increasing"
        );
    }
    for sample in &samples {
        assert_eq!(sample.raw, Value::Integer(21));
        assert_eq!(sample.physical, Value::Integer(42));
    }

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn daq_measurement_streams_decoded_samples() {
    let context = rig_context();
    context.set_signal_config(SignalConfig::daq("rig/speed", "10ms"));
    context.set_signal_config(SignalConfig::daq("rig/level", "10ms"));

    let slave = MockSlave::new();
    slave.poke(0x1000, &100u16.to_le_bytes());
    slave.poke(0x1010, &[7]);

    let mut client = XcpClient::new(context);
    client.connect(Box::new(slave)).expect("connect");
    let events = client.subscribe();

    client.setup_measurement().expect("setup");
    client.start_measurement().expect("start");
    std::thread::sleep(Duration::from_millis(200));
    client.stop_measurement().expect("stop");

    let speed = drain_samples(&events, "rig/speed");
    // 10 ms cycle over 200 ms; allow generous scheduling slack.
    assert!(speed.len() >= 5, "expected a stream, got {}", speed.len());
    assert_eq!(speed[0].raw, Value::Integer(100));
    assert_eq!(speed[0].physical, Value::Integer(200));
}

#[test]
fn event_channels_are_enumerated_with_cycles() {
    let context = rig_context();
    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");

    let channels = client.get_event_channels();
    assert_eq!(channels.get("10ms").map(String::as_str), Some("10ms"));
    assert_eq!(channels.get("100ms").map(String::as_str), Some("100ms"));
}

#[test]
fn connect_failure_unwinds_completely() {
    let context = rig_context();
    let mut client = XcpClient::new(context);

    let no_daq = MockSlave::with_config(MockConfig {
        supports_daq: false,
        ..MockConfig::default()
    });
    let err = client.connect(Box::new(no_daq)).unwrap_err();
    assert!(matches!(
        err,
        XcpError::WithContext { ref source, .. }
            if matches!(**source, XcpError::UnsupportedDevice(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The client is reusable after the failed attempt.
    client.connect(Box::new(MockSlave::new())).expect("reconnect");
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[test]
fn locked_slave_unlocks_during_connect() {
    let context = rig_context();
    context.set_signal_config(SignalConfig::daq("rig/speed", "10ms"));

    let locked = MockSlave::with_config(MockConfig {
        daq_locked: true,
        ..MockConfig::default()
    });
    let mut client = XcpClient::new(context);
    client.connect(Box::new(locked)).expect("connect unlocks daq");
    client.setup_measurement().expect("setup after unlock");
}

#[test]
fn calibration_round_trip_and_chunked_array() {
    let context = rig_context();
    let slave = MockSlave::new();
    // 4 x ULONG = 16 bytes, beyond one CTO: exercises SET_MTA + UPLOAD.
    slave.poke(0x2100, &1u32.to_le_bytes());
    slave.poke(0x2104, &2u32.to_le_bytes());
    slave.poke(0x2108, &3u32.to_le_bytes());
    slave.poke(0x210C, &4u32.to_le_bytes());

    let mut client = XcpClient::new(context);
    client.connect(Box::new(slave)).expect("connect");

    client
        .download("rig/limit", &Value::Integer(5000))
        .expect("download");
    let (raw, physical) = client.upload("rig/limit").expect("upload");
    assert_eq!(raw, Value::Integer(5000));
    assert_eq!(physical, Value::Integer(5000));

    let (raw, _) = client.upload("rig/gains").expect("chunked upload");
    assert_eq!(raw, Value::IntArray(vec![1, 2, 3, 4]));

    client
        .download("rig/gains", &Value::IntArray(vec![9, 8, 7, 6]))
        .expect("chunked download");
    let (raw, _) = client.upload("rig/gains").expect("re-upload");
    assert_eq!(raw, Value::IntArray(vec![9, 8, 7, 6]));
}

#[test]
fn raw_download_is_single_command_guarded() {
    let context = rig_context();
    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");

    // MAX_CTO 8 leaves 6 bytes per DOWNLOAD.
    let err = client.download_raw(0x2000, &[0u8; 7]).unwrap_err();
    assert!(matches!(err, XcpError::Size(_)));

    client
        .download_raw(0x2000, &0x0123u16.to_le_bytes())
        .expect("raw write");
    let (raw, _) = client.upload("rig/limit").expect("upload");
    assert_eq!(raw, Value::Integer(0x0123));
}

#[test]
fn cal_page_switching() {
    let context = rig_context();
    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");

    assert_eq!(client.get_cal_page().expect("get"), 0);
    client.set_cal_page(1).expect("set");
    assert_eq!(client.get_cal_page().expect("get"), 1);
}

#[test]
fn setup_rejects_unknown_event_channel() {
    let context = rig_context();
    context.set_signal_config(SignalConfig::daq("rig/speed", "nonexistent"));

    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");
    let err = client.setup_measurement().unwrap_err();
    assert!(matches!(err, XcpError::ProtocolViolation(_)));
}

#[test]
fn setup_rejects_oversized_polled_symbol() {
    // 10 x ULONG = 40 bytes, past the mock's 31-byte ODT entry limit.
    // Polled symbols honor the same slave limits as event-driven ones.
    let mut ctx = CalContext::new();
    ctx.add_database(
        Database::from_json(
            r#"{
                "name": "bench",
                "parameters": [
                    { "name": "wide", "address": "0x3000", "datatype": "ULONG",
                      "count": 10, "parameter_type": "ARRAY" }
                ]
            }"#,
        )
        .expect("bench database parses"),
    );
    let context = Arc::new(ctx);
    context.set_signal_config(SignalConfig::polling("bench/wide").with_rate_ms(100));

    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");
    let err = client.setup_measurement().unwrap_err();
    assert!(matches!(err, XcpError::Size(_)));
}

#[test]
fn connect_rejects_undersized_max_cto() {
    let context = rig_context();
    let mut client = XcpClient::new(context);

    let tiny = MockSlave::with_config(MockConfig {
        max_cto: 1,
        ..MockConfig::default()
    });
    let err = client.connect(Box::new(tiny)).unwrap_err();
    assert!(matches!(
        err,
        XcpError::WithContext { ref source, .. }
            if matches!(**source, XcpError::ProtocolViolation(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn measurement_requires_configured_signals() {
    let context = rig_context();
    let mut client = XcpClient::new(context);
    client.connect(Box::new(MockSlave::new())).expect("connect");
    client.setup_measurement().expect("empty setup is fine");
    let err = client.start_measurement().unwrap_err();
    assert!(matches!(err, XcpError::Setup(_)));
}
