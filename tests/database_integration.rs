//! Database loading through the filesystem

mod common;

use std::io::Write;

use xcpcal_rs::database::{size_of, SymbolRef};
use xcpcal_rs::{CalContext, XcpError};

#[test]
fn load_resolve_and_size_symbols_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(common::RIG_DB.as_bytes()).expect("write db");

    let mut context = CalContext::new();
    context.load_database(file.path()).expect("load");

    let (db, symbol) = context.resolve("rig/speed").expect("resolve signal");
    assert_eq!(db.name, "rig");
    assert_eq!(symbol.address(), 0x1000);
    assert_eq!(size_of(&symbol), 2);
    assert_eq!(symbol.unit(), None);

    let (_, symbol) = context.resolve("rig/gains").expect("resolve parameter");
    assert!(matches!(symbol, SymbolRef::Parameter(_)));
    assert_eq!(size_of(&symbol), 16);
}

#[test]
fn malformed_document_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"{ \"name\": ").expect("write");

    let mut context = CalContext::new();
    let err = context.load_database(file.path()).unwrap_err();
    assert!(matches!(err, XcpError::Config(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let mut context = CalContext::new();
    let err = context
        .load_database("/nonexistent/definitely/not/here.json")
        .unwrap_err();
    assert!(matches!(err, XcpError::Io(_)));
}
