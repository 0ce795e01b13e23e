//! Shared calibration context
//!
//! One explicit object holds the loaded symbol databases and the per-signal
//! acquisition configuration. The embedding layer constructs it, edits the
//! signal configs, and hands an `Arc` to the client; nothing in the crate
//! reaches for process-wide state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::database::{Database, SymbolRef};
use crate::error::{Result, XcpError};
use crate::types::SignalConfig;

/// Databases plus signal configuration for one device
#[derive(Debug, Default)]
pub struct CalContext {
    databases: Vec<Database>,
    signal_config: Mutex<HashMap<String, SignalConfig>>,
}

impl CalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and add a database file
    pub fn load_database(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let db = Database::load(path)?;
        tracing::info!(database = %db.name, "database loaded");
        self.databases.push(db);
        Ok(())
    }

    /// Add an already-built database
    pub fn add_database(&mut self, db: Database) {
        self.databases.push(db);
    }

    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    /// Resolve a scoped identifier `<database>/<name>` across all databases
    pub fn resolve(&self, identifier: &str) -> Result<(&Database, SymbolRef<'_>)> {
        let (db_name, symbol_name) = identifier.split_once('/').ok_or_else(|| {
            XcpError::NotFound(format!(
                "'{}' is not a scoped identifier (<database>/<name>)",
                identifier
            ))
        })?;
        let db = self
            .databases
            .iter()
            .find(|db| db.name == db_name)
            .ok_or_else(|| XcpError::NotFound(format!("no database named '{}'", db_name)))?;
        let symbol = db.find(symbol_name).ok_or_else(|| {
            XcpError::NotFound(format!("'{}' not in database '{}'", symbol_name, db_name))
        })?;
        Ok((db, symbol))
    }

    /// Insert or replace one signal's acquisition configuration
    pub fn set_signal_config(&self, config: SignalConfig) {
        self.signal_config
            .lock()
            .expect("signal config poisoned")
            .insert(config.identifier.clone(), config);
    }

    /// Remove a signal's configuration
    pub fn remove_signal_config(&self, identifier: &str) {
        self.signal_config
            .lock()
            .expect("signal config poisoned")
            .remove(identifier);
    }

    /// Snapshot of the enabled signal configurations
    pub fn enabled_signals(&self) -> Vec<SignalConfig> {
        self.signal_config
            .lock()
            .expect("signal config poisoned")
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AcquisitionChannel;

    fn context() -> CalContext {
        let mut ctx = CalContext::new();
        ctx.add_database(
            Database::from_json(
                r#"{
                    "name": "engine",
                    "signals": [
                        { "name": "RPM", "address": "0x1000", "datatype": "UWORD" }
                    ]
                }"#,
            )
            .unwrap(),
        );
        ctx
    }

    #[test]
    fn test_scoped_resolution() {
        let ctx = context();
        let (db, sym) = ctx.resolve("engine/RPM").unwrap();
        assert_eq!(db.name, "engine");
        assert_eq!(sym.address(), 0x1000);

        assert!(matches!(
            ctx.resolve("engine/NOPE"),
            Err(XcpError::NotFound(_))
        ));
        assert!(matches!(
            ctx.resolve("other/RPM"),
            Err(XcpError::NotFound(_))
        ));
        assert!(matches!(ctx.resolve("RPM"), Err(XcpError::NotFound(_))));
    }

    #[test]
    fn test_signal_config_snapshot() {
        let ctx = context();
        ctx.set_signal_config(SignalConfig::polling("engine/RPM"));
        ctx.set_signal_config(SignalConfig::polling("engine/T").with_enabled(false));

        let enabled = ctx.enabled_signals();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].identifier, "engine/RPM");
        assert_eq!(enabled[0].channel, AcquisitionChannel::Polling);

        ctx.remove_signal_config("engine/RPM");
        assert!(ctx.enabled_signals().is_empty());
    }
}
