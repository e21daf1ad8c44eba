//! Perfetto protobuf trace consumer, powered by `retrobus-perfetto`.
//!
//! Bus records become instant events on per-category tracks (memory,
//! devices, invalid accesses, mappings, execution), timestamped with the
//! global cycle clock, plus a running cycle counter track. Open the output
//! in ui.perfetto.dev.

use std::path::PathBuf;

use retrobus_perfetto::{AnnotationValue, PerfettoTraceBuilder, TrackId};

use crate::trace::{TraceKind, TraceRecord, TraceSink};
use crate::{CoreError, Result};

pub struct PerfettoTrace {
    builder: PerfettoTraceBuilder,
    mem_track: TrackId,
    dev_track: TrackId,
    invalid_track: TrackId,
    map_track: TrackId,
    exec_track: TrackId,
    cycle_counter: TrackId,
    path: PathBuf,
}

impl PerfettoTrace {
    pub fn new(path: PathBuf) -> Self {
        let mut builder = PerfettoTraceBuilder::new("m68k");
        let mem_track = builder.add_thread("Memory");
        let dev_track = builder.add_thread("Devices");
        let invalid_track = builder.add_thread("InvalidAccess");
        let map_track = builder.add_thread("Mappings");
        let exec_track = builder.add_thread("Execution");
        let cycle_counter = builder.add_counter_track("cycles", Some("cycles"), None);
        Self {
            builder,
            mem_track,
            dev_track,
            invalid_track,
            map_track,
            exec_track,
            cycle_counter,
            path,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn track_for(&self, kind: TraceKind) -> TrackId {
        match kind {
            TraceKind::Read | TraceKind::Write => self.mem_track,
            TraceKind::DevRead | TraceKind::DevWrite => self.dev_track,
            TraceKind::InvalidRead | TraceKind::InvalidWrite => self.invalid_track,
            TraceKind::Map | TraceKind::Unmap | TraceKind::Move => self.map_track,
            TraceKind::Instr => self.exec_track,
        }
    }

    fn event_name(rec: &TraceRecord) -> String {
        match rec.kind {
            TraceKind::Instr => format!("Exec@{:#010x}", rec.addr),
            TraceKind::Map => format!("Map@{:#010x}", rec.addr),
            TraceKind::Unmap => format!("Unmap@{:#010x}", rec.addr),
            TraceKind::Move => format!("Move@{:#010x}", rec.addr),
            TraceKind::Read | TraceKind::DevRead => format!("Read@{:#010x}", rec.addr),
            TraceKind::Write | TraceKind::DevWrite => format!("Write@{:#010x}", rec.addr),
            TraceKind::InvalidRead => format!("BadRead@{:#010x}", rec.addr),
            TraceKind::InvalidWrite => format!("BadWrite@{:#010x}", rec.addr),
        }
    }

    /// Write the collected trace out.
    pub fn finish(self) -> Result<()> {
        self.builder
            .save(&self.path)
            .map_err(|e| CoreError::Config(format!("perfetto save: {e}")))
    }
}

impl TraceSink for PerfettoTrace {
    fn record(&mut self, now: u64, rec: &TraceRecord) {
        let track = self.track_for(rec.kind);
        let mut ev = self
            .builder
            .add_instant_event(track, Self::event_name(rec), now as i64);
        ev.add_annotations([
            ("kind", AnnotationValue::Str(rec.kind.code().to_string())),
            ("address", AnnotationValue::Pointer(rec.addr as u64)),
            ("width", AnnotationValue::UInt(rec.width as u64)),
            ("value", AnnotationValue::UInt(rec.value as u64)),
        ]);
        ev.finish();
        self.builder
            .update_counter(self.cycle_counter, now as f64, now as i64);
    }
}
