//! Shared helpers for the integration suite

use std::sync::Arc;

use xcpcal_rs::{CalContext, Database};

/// Tolerance-based float comparison
#[allow(dead_code)]
pub fn assert_float_eq(a: f64, b: f64) {
    assert!(
        (a - b).abs() < 1e-9,
        "expected {} to equal {} within tolerance",
        a,
        b
    );
}

/// Database for the bench rig mock: one fast signal, one scaled signal,
/// one writable parameter, one array parameter.
pub const RIG_DB: &str = r#"{
    "name": "rig",
    "byte_order": "MSB_LAST",
    "compu_methods": [
        { "name": "double", "kind": "linear", "a": 2.0, "b": 0.0 }
    ],
    "parameters": [
        { "name": "limit", "address": "0x2000", "datatype": "UWORD" },
        { "name": "gains", "address": "0x2100", "datatype": "ULONG",
          "count": 4, "parameter_type": "ARRAY" }
    ],
    "signals": [
        { "name": "speed", "address": "0x1000", "datatype": "UWORD",
          "compu_method": "double" },
        { "name": "level", "address": "0x1010", "datatype": "UBYTE" }
    ]
}"#;

#[allow(dead_code)]
pub fn rig_context() -> Arc<CalContext> {
    let mut ctx = CalContext::new();
    ctx.add_database(Database::from_json(RIG_DB).expect("rig database parses"));
    Arc::new(ctx)
}
