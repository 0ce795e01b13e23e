//! Deposit-size computation and symbol references
//!
//! The deposit size is the actual storage footprint of a typed value after
//! alignment rules are applied: `max(native size, class alignment)`. Array
//! parameters occupy `count` contiguous deposit-sized slots.

use super::{Alignment, Parameter, ParameterKind, Signal};
use crate::types::Datatype;

/// A resolved reference to either kind of symbol
///
/// The two kinds are matched exhaustively; code that only handles one of
/// them fails to compile when a new kind appears.
#[derive(Debug, Clone, Copy)]
pub enum SymbolRef<'a> {
    /// A calibration parameter
    Parameter(&'a Parameter),
    /// A measurement signal
    Signal(&'a Signal),
}

impl<'a> SymbolRef<'a> {
    /// Local name of the symbol
    pub fn name(&self) -> &str {
        match self {
            SymbolRef::Parameter(p) => &p.name,
            SymbolRef::Signal(s) => &s.name,
        }
    }

    /// Resolved memory address
    pub fn address(&self) -> u64 {
        match self {
            SymbolRef::Parameter(p) => p.resolved_address,
            SymbolRef::Signal(s) => s.resolved_address,
        }
    }

    /// Storage datatype
    pub fn datatype(&self) -> Datatype {
        match self {
            SymbolRef::Parameter(p) => p.datatype,
            SymbolRef::Signal(s) => s.datatype,
        }
    }

    /// Element count (signals are always scalar)
    pub fn count(&self) -> u32 {
        match self {
            SymbolRef::Parameter(p) => p.count.unwrap_or(1),
            SymbolRef::Signal(_) => 1,
        }
    }

    /// Parameter kind; signals behave like scalar values
    pub fn kind(&self) -> ParameterKind {
        match self {
            SymbolRef::Parameter(p) => p.kind,
            SymbolRef::Signal(_) => ParameterKind::Value,
        }
    }

    /// Effective alignment after field-by-field fallback
    pub fn alignment(&self) -> &Alignment {
        match self {
            SymbolRef::Parameter(p) => &p.effective_alignment,
            SymbolRef::Signal(s) => &s.effective_alignment,
        }
    }

    /// Resolved encoding rule, if any
    pub fn compu_method(&self) -> Option<&super::CompuMethod> {
        match self {
            SymbolRef::Parameter(p) => p.compu_method_ref.as_deref(),
            SymbolRef::Signal(s) => s.compu_method_ref.as_deref(),
        }
    }

    /// Unit string for display
    pub fn unit(&self) -> Option<&str> {
        match self {
            SymbolRef::Parameter(p) => p.unit.as_deref(),
            SymbolRef::Signal(s) => s.unit.as_deref(),
        }
    }
}

/// Storage footprint of one element of `datatype` under `alignment`
pub fn deposit(datatype: Datatype, alignment: &Alignment) -> u32 {
    let class_alignment = match datatype {
        Datatype::Ubyte | Datatype::Sbyte => alignment.byte,
        Datatype::Uword | Datatype::Sword => alignment.word,
        Datatype::Ulong | Datatype::Slong => alignment.long,
        Datatype::AUint64 | Datatype::AInt64 => alignment.int64,
        Datatype::Float32Ieee => alignment.float32,
        Datatype::Float64Ieee => alignment.float64,
    };
    datatype.native_size().max(class_alignment)
}

/// Total storage size of a symbol
///
/// Parameters scale by their element count; signals are never arrays in
/// this model.
pub fn size_of(symbol: &SymbolRef<'_>) -> u32 {
    match symbol {
        SymbolRef::Parameter(p) => {
            p.count.unwrap_or(1) * deposit(p.datatype, &p.effective_alignment)
        }
        SymbolRef::Signal(s) => deposit(s.datatype, &s.effective_alignment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_takes_max_of_size_and_alignment() {
        let alignment = Alignment::default();
        assert_eq!(deposit(Datatype::Ubyte, &alignment), 1);
        assert_eq!(deposit(Datatype::Uword, &alignment), 2);
        assert_eq!(deposit(Datatype::Float64Ieee, &alignment), 8);

        let padded = Alignment {
            byte: 4,
            ..Alignment::default()
        };
        assert_eq!(deposit(Datatype::Sbyte, &padded), 4);
        // Native size already exceeds the class minimum.
        let loose = Alignment {
            int64: 2,
            ..Alignment::default()
        };
        assert_eq!(deposit(Datatype::AInt64, &loose), 8);
    }

    #[test]
    fn test_size_of_array_parameter() {
        let db = crate::database::Database::from_json(
            r#"{
                "name": "d",
                "parameters": [
                    { "name": "curve_vals", "address": "0x0", "datatype": "UWORD",
                      "count": 6, "parameter_type": "ARRAY",
                      "alignment": { "word": 4 } }
                ]
            }"#,
        )
        .unwrap();
        let sym = db.find("curve_vals").unwrap();
        // 6 elements x max(2, 4) bytes each
        assert_eq!(size_of(&sym), 24);
    }
}
