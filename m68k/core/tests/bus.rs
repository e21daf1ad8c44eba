//! Bus fabric invariants: round-trips, overlap rejection, fault policy,
//! ghost mappings, disassembly purity.

use m68k_core::bus::{Bus, BusConfig};
use m68k_core::cpu::CpuBus;
use m68k_core::mem::Width;
use m68k_core::trace::{RecordingTrace, TraceKind, MAP_RAM, MAP_ROM};
use m68k_core::CoreError;

use proptest::prelude::*;

fn bus_with_ram() -> Bus {
    let mut bus = Bus::new(BusConfig::default());
    bus.add_memory(0, 0x10000, true, None).unwrap();
    bus
}

#[test]
fn write_then_read_returns_masked_value() {
    let mut bus = bus_with_ram();
    bus.write8(0x20, 0xfe);
    assert_eq!(bus.read8(0x20), 0xfe);
    bus.write16(0x40, 0xdead);
    assert_eq!(bus.read16(0x40), 0xdead);
    bus.write32(0x60, 0x0102_0304);
    assert_eq!(bus.read32(0x60), 0x0102_0304);
}

#[test]
fn overlapping_widths_reconstruct_big_endian() {
    let mut bus = bus_with_ram();
    bus.write32(0x100, 0xaabb_ccdd);
    assert_eq!(bus.read16(0x100), 0xaabb);
    assert_eq!(bus.read16(0x102), 0xccdd);
    assert_eq!(bus.read8(0x100), 0xaa);
    assert_eq!(bus.read8(0x103), 0xdd);

    bus.write8(0x102, 0x11);
    assert_eq!(bus.read32(0x100), 0xaabb_11dd);
}

#[test]
fn removed_region_leaves_no_ghost_mapping() {
    let mut bus = bus_with_ram();
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));
    bus.add_memory(0x40000, 0x1000, true, None).unwrap();
    bus.write32(0x40000, 0x1234_5678);
    bus.remove_memory(0x40000).unwrap();

    assert_eq!(bus.read32(0x40000), 0);
    assert!(bus.take_bus_error());
    assert_eq!(tap.count(TraceKind::InvalidRead), 1);
    assert_eq!(tap.count(TraceKind::Unmap), 1);

    // remapping the same range starts from zeroes
    bus.add_memory(0x40000, 0x1000, true, None).unwrap();
    assert_eq!(bus.read32(0x40000), 0);
    assert!(!bus.take_bus_error());
}

#[test]
fn overlap_attempts_fail_without_mutating() {
    let mut bus = bus_with_ram();
    assert!(matches!(
        bus.add_memory(0x8000, 0x10000, true, None),
        Err(CoreError::Overlap { .. })
    ));
    // the prior mapping still intact, the tail still unmapped
    bus.write32(0xfffc, 0x55aa_55aa);
    assert_eq!(bus.read32(0xfffc), 0x55aa_55aa);
    let _ = bus.read8(0x10000);
    assert!(bus.take_bus_error());
}

#[test]
fn map_records_carry_flavor() {
    let mut bus = Bus::new(BusConfig::default());
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));
    bus.add_memory(0, 0x1000, true, None).unwrap();
    bus.add_memory(0x1000, 0x1000, false, None).unwrap();
    let recs = tap.records();
    assert_eq!(recs.len(), 2);
    assert_eq!((recs[0].kind, recs[0].value), (TraceKind::Map, MAP_RAM));
    assert_eq!((recs[1].kind, recs[1].value), (TraceKind::Map, MAP_ROM));
}

#[test]
fn move_preserves_contents_and_traces() {
    let mut bus = bus_with_ram();
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));
    bus.add_memory(0x40000, 0x1000, true, Some(b"payload")).unwrap();
    bus.move_memory(0x40000, 0x80000).unwrap();

    assert_eq!(bus.read8(0x80000), b'p');
    let _ = bus.read8(0x40000);
    assert!(bus.take_bus_error());
    assert_eq!(tap.count(TraceKind::Move), 1);
}

#[test]
fn memory_tracing_is_opt_in_but_invalid_is_not() {
    let mut bus = bus_with_ram();
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));

    bus.write16(0x10, 0x1234);
    let _ = bus.read16(0x10);
    assert_eq!(tap.count(TraceKind::Read), 0);
    assert_eq!(tap.count(TraceKind::Write), 0);

    bus.set_trace_memory(true);
    bus.write16(0x10, 0x1234);
    let _ = bus.read16(0x10);
    assert_eq!(tap.count(TraceKind::Read), 1);
    assert_eq!(tap.count(TraceKind::Write), 1);

    bus.set_trace_memory(false);
    let _ = bus.read16(0x70_0000);
    assert!(bus.take_bus_error());
    assert_eq!(tap.count(TraceKind::InvalidRead), 1);
}

#[test]
fn instruction_reads_skip_memory_tracing() {
    let mut bus = bus_with_ram();
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));
    bus.set_trace_memory(true);
    bus.write16(0x200, 0x4e71);
    tap.clear();
    assert_eq!(bus.read_instr_16(0x200), 0x4e71);
    assert_eq!(bus.read_instr_32(0x200), 0x4e71_0000);
    assert_eq!(tap.count(TraceKind::Read), 0);
}

#[test]
fn disasm_reads_are_pure() {
    let mut bus = bus_with_ram();
    let tap = RecordingTrace::new();
    bus.set_trace_sink(Box::new(tap.clone()));
    bus.set_trace_memory(true);

    bus.write16(0x300, 0x4e75);
    tap.clear();

    assert_eq!(bus.read_disasm_16(0x300), 0x4e75);
    // misses return the sentinel, produce no trace and no fault
    assert_eq!(bus.read_disasm_16(0x90_0000), 0xffff);
    assert_eq!(bus.read_disasm_32(0x90_0000), 0xffff_ffff);
    assert!(tap.records().is_empty());
    assert!(!bus.take_bus_error());
}

proptest! {
    // Any value written at any mapped address round-trips through its width's mask.
    #[test]
    fn bus_round_trip(addr in 0u32..0xff00, value: u32, width_sel in 0u8..3) {
        let mut bus = bus_with_ram();
        let width = [Width::Byte, Width::Word, Width::Long][width_sel as usize];
        // keep the access aligned and inside the region
        let addr = addr & !(width.bytes() - 1);
        match width {
            Width::Byte => {
                bus.write8(addr, value as u8);
                prop_assert_eq!(bus.read8(addr) as u32, value & 0xff);
            }
            Width::Word => {
                bus.write16(addr, value as u16);
                prop_assert_eq!(bus.read16(addr) as u32, value & 0xffff);
            }
            Width::Long => {
                bus.write32(addr, value);
                prop_assert_eq!(bus.read32(addr), value);
            }
        }
    }

    // Two adjacent word writes read back as one big-endian long.
    #[test]
    fn adjacent_words_compose(addr in 0u32..0xff0, hi: u16, lo: u16) {
        let mut bus = bus_with_ram();
        let addr = addr & !3;
        bus.write16(addr, hi);
        bus.write16(addr + 2, lo);
        prop_assert_eq!(bus.read32(addr), (hi as u32) << 16 | lo as u32);
    }
}
