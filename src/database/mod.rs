//! Symbol database loading and post-load resolution
//!
//! One JSON document per device describes its parameters and signals
//! (name, address literal, datatype, count, encoding-rule name, alignment
//! overrides) plus a table of named encoding rules. The document is
//! consumed once at load time; the resulting [`Database`] is immutable
//! afterwards apart from the cross-references populated during resolution
//! (encoding-rule handles, axis references).
//!
//! # Document shape
//!
//! ```json
//! {
//!   "name": "engine",
//!   "byte_order": "MSB_LAST",
//!   "alignment": { "word": 2, "long": 4 },
//!   "compu_methods": [
//!     { "name": "temp", "kind": "linear", "a": 0.1, "b": -40.0, "unit": "degC" },
//!     { "name": "gear", "kind": "dictionary", "dictionary": { "0": "N", "1": "1st" } }
//!   ],
//!   "parameters": [
//!     { "name": "idle_target", "address": "0x1000", "datatype": "UWORD",
//!       "compu_method": "temp" }
//!   ],
//!   "signals": [
//!     { "name": "rpm", "address": "4100", "datatype": "UWORD" }
//!   ]
//! }
//! ```
//!
//! Address literals are parsed with base detection: `0x` hex, `0o` octal,
//! `0b` binary, plain decimal otherwise.

pub mod resolver;

pub use resolver::{deposit, size_of, SymbolRef};

use crate::error::{Result, XcpError};
use crate::types::{ByteOrder, Datatype};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Effective per-datatype-class minimum alignments, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Minimum alignment for 8-bit integers
    pub byte: u32,
    /// Minimum alignment for 16-bit integers
    pub word: u32,
    /// Minimum alignment for 32-bit integers
    pub long: u32,
    /// Minimum alignment for 64-bit integers
    pub int64: u32,
    /// Minimum alignment for 32-bit floats
    pub float32: u32,
    /// Minimum alignment for 64-bit floats
    pub float64: u32,
}

impl Default for Alignment {
    fn default() -> Self {
        Self {
            byte: 1,
            word: 2,
            long: 4,
            int64: 8,
            float32: 4,
            float64: 8,
        }
    }
}

/// Partial alignment block as it appears in the document
///
/// Every field is optional; fallback is field-by-field (symbol override →
/// database block → built-in default), never a whole-block substitution.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignmentOverride {
    pub byte: Option<u32>,
    pub word: Option<u32>,
    pub long: Option<u32>,
    pub int64: Option<u32>,
    pub float32: Option<u32>,
    pub float64: Option<u32>,
}

impl AlignmentOverride {
    /// Resolve against a base alignment, field by field
    pub fn resolve_against(&self, base: &Alignment) -> Alignment {
        Alignment {
            byte: self.byte.unwrap_or(base.byte),
            word: self.word.unwrap_or(base.word),
            long: self.long.unwrap_or(base.long),
            int64: self.int64.unwrap_or(base.int64),
            float32: self.float32.unwrap_or(base.float32),
            float64: self.float64.unwrap_or(base.float64),
        }
    }
}

/// Encoding rule variants
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompuRule {
    /// Physical value equals the raw value
    Identity,
    /// `physical = raw * a + b`, inverse `raw = (physical - b) / a`
    Linear { a: f64, b: f64 },
    /// Raw integer (as decimal string key) to label, inverted by value search
    Dictionary { dictionary: HashMap<String, String> },
}

/// A named encoding rule (CompuMethod)
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CompuMethod {
    /// Rule name referenced by symbols
    pub name: String,
    /// Unit string inherited by symbols that declare none
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub rule: CompuRule,
}

/// Kind of a parameter, governing how its bytes are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterKind {
    /// Single scalar value
    #[default]
    Value,
    /// Raw character bytes, read-only
    Ascii,
    /// Fixed-length array of scalars
    Array,
    /// Curve with an axis reference (codec support pending)
    Curve,
    /// Map with two axis references (codec support pending)
    Map,
}

/// A calibration parameter (writable symbol)
#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    /// Local name within the database
    pub name: String,
    /// Address literal, hex or decimal
    pub address: String,
    /// Storage datatype
    pub datatype: Datatype,
    /// Element count; values > 1 imply an array/curve/map
    #[serde(default)]
    pub count: Option<u32>,
    /// Parameter kind
    #[serde(default, rename = "parameter_type")]
    pub kind: ParameterKind,
    /// Name of the encoding rule, if any
    #[serde(default)]
    pub compu_method: Option<String>,
    /// Per-symbol alignment overrides
    #[serde(default)]
    pub alignment: Option<AlignmentOverride>,
    /// Unit string
    #[serde(default)]
    pub unit: Option<String>,
    /// X axis parameter name (curves and maps)
    #[serde(default)]
    pub ref_x: Option<String>,
    /// Y axis parameter name (maps)
    #[serde(default)]
    pub ref_y: Option<String>,

    /// Effective alignment, populated during resolution
    #[serde(skip)]
    pub effective_alignment: Alignment,
    /// Resolved encoding rule, populated during resolution
    #[serde(skip)]
    pub compu_method_ref: Option<Arc<CompuMethod>>,
    /// Parsed address, populated during resolution
    #[serde(skip)]
    pub resolved_address: u64,
}

/// A measurement signal (read-only symbol, never an array)
#[derive(Debug, Clone, Deserialize)]
pub struct Signal {
    /// Local name within the database
    pub name: String,
    /// Address literal, hex or decimal
    pub address: String,
    /// Storage datatype
    pub datatype: Datatype,
    /// Name of the encoding rule, if any
    #[serde(default)]
    pub compu_method: Option<String>,
    /// Per-symbol alignment overrides
    #[serde(default)]
    pub alignment: Option<AlignmentOverride>,
    /// Unit string
    #[serde(default)]
    pub unit: Option<String>,

    /// Effective alignment, populated during resolution
    #[serde(skip)]
    pub effective_alignment: Alignment,
    /// Resolved encoding rule, populated during resolution
    #[serde(skip)]
    pub compu_method_ref: Option<Arc<CompuMethod>>,
    /// Parsed address, populated during resolution
    #[serde(skip)]
    pub resolved_address: u64,
}

/// An in-memory symbol database for one device
#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    /// Database name, the scope prefix of every owned identifier
    pub name: String,
    /// Byte order of all symbols in this database
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Database-wide alignment overrides
    #[serde(default)]
    pub alignment: Option<AlignmentOverride>,
    /// Calibration parameters
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Measurement signals
    #[serde(default)]
    pub signals: Vec<Signal>,
    /// Named encoding rules
    #[serde(default)]
    pub compu_methods: Vec<CompuMethod>,
}

/// Parse an address literal with base detection
pub fn parse_address(literal: &str) -> Result<u64> {
    let s = literal.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (s, 10)
    };
    u64::from_str_radix(&digits.replace('_', ""), radix)
        .map_err(|e| XcpError::Config(format!("invalid address literal '{}': {}", literal, e)))
}

impl Database {
    /// Load a database document from a file and resolve it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Parse a database document from a JSON string and resolve it
    pub fn from_json(contents: &str) -> Result<Self> {
        let mut db: Database = serde_json::from_str(contents)?;
        db.resolve()?;
        Ok(db)
    }

    /// Populate cross-references and effective alignments
    ///
    /// Called once after deserialization; the database is treated as
    /// immutable afterwards.
    fn resolve(&mut self) -> Result<()> {
        let base = self
            .alignment
            .map(|ov| ov.resolve_against(&Alignment::default()))
            .unwrap_or_default();

        let methods: HashMap<&str, Arc<CompuMethod>> = self
            .compu_methods
            .iter()
            .map(|cm| (cm.name.as_str(), Arc::new(cm.clone())))
            .collect();

        let axis_names: Vec<String> = self.parameters.iter().map(|p| p.name.clone()).collect();

        for p in &mut self.parameters {
            p.effective_alignment = match p.alignment {
                Some(ov) => ov.resolve_against(&base),
                None => base,
            };
            p.resolved_address = parse_address(&p.address)?;
            if p.count.is_none() {
                p.count = Some(1);
            }
            if let Some(cm_name) = &p.compu_method {
                let cm = methods.get(cm_name.as_str()).ok_or_else(|| {
                    XcpError::Config(format!(
                        "parameter '{}' references unknown compu method '{}'",
                        p.name, cm_name
                    ))
                })?;
                if p.unit.is_none() {
                    p.unit = cm.unit.clone();
                }
                p.compu_method_ref = Some(cm.clone());
            }
            for axis in [&p.ref_x, &p.ref_y].into_iter().flatten() {
                if !axis_names.contains(axis) {
                    return Err(XcpError::Config(format!(
                        "parameter '{}' references unknown axis '{}'",
                        p.name, axis
                    )));
                }
            }
        }

        for s in &mut self.signals {
            s.effective_alignment = match s.alignment {
                Some(ov) => ov.resolve_against(&base),
                None => base,
            };
            s.resolved_address = parse_address(&s.address)?;
            if let Some(cm_name) = &s.compu_method {
                let cm = methods.get(cm_name.as_str()).ok_or_else(|| {
                    XcpError::Config(format!(
                        "signal '{}' references unknown compu method '{}'",
                        s.name, cm_name
                    ))
                })?;
                if s.unit.is_none() {
                    s.unit = cm.unit.clone();
                }
                s.compu_method_ref = Some(cm.clone());
            }
        }

        tracing::debug!(
            "Resolved database '{}': {} parameters, {} signals, {} compu methods",
            self.name,
            self.parameters.len(),
            self.signals.len(),
            self.compu_methods.len()
        );
        Ok(())
    }

    /// Look up a symbol by local name
    ///
    /// Parameters shadow signals of the same name, matching the original
    /// lookup order.
    pub fn find(&self, name: &str) -> Option<SymbolRef<'_>> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(SymbolRef::Parameter)
            .or_else(|| {
                self.signals
                    .iter()
                    .find(|s| s.name == name)
                    .map(SymbolRef::Signal)
            })
    }

    /// Resolve a local name to `(address, size, symbol)`
    pub fn resolve_symbol(&self, name: &str) -> Result<(u64, u32, SymbolRef<'_>)> {
        let sym = self.find(name).ok_or_else(|| {
            XcpError::NotFound(format!("'{}' not found in database '{}'", name, self.name))
        })?;
        Ok((sym.address(), size_of(&sym), sym))
    }

    /// Scoped identifier for a local name
    pub fn identifier(&self, name: &str) -> String {
        format!("{}/{}", self.name, name)
    }
}
