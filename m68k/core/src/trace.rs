//! Bus trace stream.
//!
//! Every observable bus operation can be forwarded to a [`TraceSink`] as a
//! structured [`TraceRecord`]; the record type is the stable interface,
//! consumers decide how to render it. [`TextTrace`] reproduces the classic
//! column format, and the `perfetto` feature adds a protobuf consumer.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::symbols::SymbolTable;

/// Region flavour carried in the value field of `Map`/`Unmap` records.
pub const MAP_ROM: u32 = 0;
pub const MAP_RAM: u32 = 1;
pub const MAP_DEVICE: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceKind {
    Read,
    Write,
    InvalidRead,
    InvalidWrite,
    Map,
    Unmap,
    Move,
    DevRead,
    DevWrite,
    Instr,
}

impl TraceKind {
    /// Single-character wire code for compact trace encodings.
    pub fn code(self) -> char {
        match self {
            TraceKind::Read => 'R',
            TraceKind::Write => 'W',
            TraceKind::InvalidRead => 'r',
            TraceKind::InvalidWrite => 'w',
            TraceKind::Map => 'M',
            TraceKind::Unmap => 'U',
            TraceKind::Move => 'o',
            TraceKind::DevRead => 'D',
            TraceKind::DevWrite => 'd',
            TraceKind::Instr => 'I',
        }
    }

    fn label(self) -> &'static str {
        match self {
            TraceKind::Read => "READ",
            TraceKind::Write => "WRITE",
            TraceKind::InvalidRead => "BAD_READ",
            TraceKind::InvalidWrite => "BAD_WRITE",
            TraceKind::Map => "MAP",
            TraceKind::Unmap => "UNMAP",
            TraceKind::Move => "MOVE",
            TraceKind::DevRead => "DEV_READ",
            TraceKind::DevWrite => "DEV_WRITE",
            TraceKind::Instr => "EXECUTE",
        }
    }
}

/// One bus event. `width` is the access width in bits, or 0 for records that
/// have none (map operations, instruction boundaries).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub kind: TraceKind,
    pub addr: u32,
    pub width: u8,
    pub value: u32,
}

pub trait TraceSink {
    /// `now` is the global cycle clock at emission time.
    fn record(&mut self, now: u64, rec: &TraceRecord);
}

/// Text consumer writing `action[10]: symbol/address[40] : info` lines.
pub struct TextTrace<W: Write> {
    out: W,
    symbols: Option<SymbolTable>,
}

impl<W: Write> TextTrace<W> {
    pub fn new(out: W) -> Self {
        Self { out, symbols: None }
    }

    /// Pretty-print addresses through a symbol table. Map operations and
    /// address zero always render raw.
    pub fn with_symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = Some(symbols);
        self
    }

    fn address_field(&self, rec: &TraceRecord) -> String {
        let symbolicate = !matches!(
            rec.kind,
            TraceKind::Map | TraceKind::Unmap | TraceKind::Move
        );
        if symbolicate {
            if let Some(label) = self.symbols.as_ref().and_then(|s| s.label(rec.addr)) {
                return format!("{} / {:#010x}", label, rec.addr);
            }
        }
        format!("{:#010x}", rec.addr)
    }

    fn info_field(rec: &TraceRecord) -> String {
        match rec.kind {
            TraceKind::Map | TraceKind::Unmap => match rec.value {
                MAP_ROM => "ROM".to_string(),
                MAP_RAM => "RAM".to_string(),
                _ => "DEVICE".to_string(),
            },
            TraceKind::Move => format!("-> {:#010x}", rec.value),
            TraceKind::Instr => String::new(),
            _ => match rec.width {
                8 => format!("{:#04x}", rec.value & 0xff),
                16 => format!("{:#06x}", rec.value & 0xffff),
                _ => format!("{:#010x}", rec.value),
            },
        }
    }
}

impl<W: Write> TraceSink for TextTrace<W> {
    fn record(&mut self, _now: u64, rec: &TraceRecord) {
        let afield = self.address_field(rec);
        let info = Self::info_field(rec);
        let _ = writeln!(self.out, "{:<10}: {:>40} : {}", rec.kind.label(), afield, info);
    }
}

/// Sink that keeps every record behind a shared handle, for tests and
/// programmatic consumers: clone the handle, install one copy on the bus,
/// inspect through the other.
#[derive(Clone, Default)]
pub struct RecordingTrace {
    records: std::rc::Rc<std::cell::RefCell<Vec<TraceRecord>>>,
}

impl RecordingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }

    pub fn count(&self, kind: TraceKind) -> usize {
        self.records.borrow().iter().filter(|r| r.kind == kind).count()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

impl TraceSink for RecordingTrace {
    fn record(&mut self, _now: u64, rec: &TraceRecord) {
        self.records.borrow_mut().push(*rec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lines_have_fixed_columns() {
        let mut sink = TextTrace::new(Vec::new());
        sink.record(
            0,
            &TraceRecord {
                kind: TraceKind::Read,
                addr: 0x1234,
                width: 16,
                value: 0xbeef,
            },
        );
        let line = String::from_utf8(sink.out).unwrap();
        assert_eq!(line, format!("{:<10}: {:>40} : 0xbeef\n", "READ", "0x00001234"));
    }

    #[test]
    fn map_records_render_flavor_without_symbolication() {
        let mut symbols = SymbolTable::new();
        symbols.add_image("test", vec![("start".to_string(), 0x2000, 0x100)]);
        let mut sink = TextTrace::new(Vec::new()).with_symbols(symbols);
        sink.record(
            0,
            &TraceRecord {
                kind: TraceKind::Map,
                addr: 0x2000,
                width: 0,
                value: MAP_RAM,
            },
        );
        let line = String::from_utf8(sink.out).unwrap();
        assert!(line.contains("0x00002000"));
        assert!(!line.contains("start"));
        assert!(line.trim_end().ends_with("RAM"));
    }
}
