//! The system bus: glue between the page map, the device slots, the
//! scheduler, the interrupt controller and the CPU.
//!
//! All CPU traffic funnels through the [`CpuBus`] implementation here. Each
//! access either lands in a buffer region, is dispatched to the device
//! owning the address, or takes the invalid path: when bus-error generation
//! is enabled that pulses the fault line and ends the timeslice so the CPU
//! takes the exception promptly, otherwise reads return zero and writes are
//! dropped. Either way the invalid operation is recorded on the trace tap.

use crate::cpu::{CpuBus, CpuRegs, IllegalOutcome};
use crate::device::{Device, DeviceCtx};
use crate::emulator::StopReason;
use crate::irq::{autovector, IrqController, VECTOR_SPURIOUS};
use crate::mem::{MemoryMap, PageKind, Width, NUM_DEVICE_SLOTS};
use crate::natfeat::{NatOutcome, NativeFeatures};
use crate::sched::Scheduler;
use crate::trace::{TraceKind, TraceRecord, TraceSink, MAP_DEVICE, MAP_RAM, MAP_ROM};
use crate::{CoreError, Result};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    /// CPU clock in Hz; the timebase for device scheduling.
    pub cycle_rate: u64,
    /// Generate guest-visible bus errors for bad accesses.
    pub bus_error: bool,
    /// Fault word/long accesses to odd addresses (68000/68010 behaviour).
    pub fault_on_misaligned: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            cycle_rate: 8_000_000,
            bus_error: true,
            fault_on_misaligned: true,
        }
    }
}

struct DeviceSlot {
    dev: Option<Box<dyn Device>>,
    name: String,
    base: u32,
    len: u32,
    ipl: u8,
    debug: bool,
}

impl DeviceSlot {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.len
    }
}

enum DevOutcome {
    Value(u32),
    NotDecoded,
    /// The handler failed; a fatal stop has already been requested.
    Failed,
}

pub struct Bus {
    cfg: BusConfig,
    mem: MemoryMap,
    slots: Vec<DeviceSlot>,
    sched: Scheduler,
    irq: IrqController,
    natfeat: NativeFeatures,
    clock: u64,
    slice_end: u64,
    stop: Option<StopReason>,
    bus_error_pending: bool,
    timeslice_end: bool,
    sink: Option<Box<dyn TraceSink>>,
    trace_memory: bool,
    trace_instructions: bool,
    trace_io: bool,
}

impl Bus {
    pub fn new(cfg: BusConfig) -> Self {
        Self {
            cfg,
            mem: MemoryMap::new(),
            slots: Vec::new(),
            sched: Scheduler::new(),
            irq: IrqController::new(),
            natfeat: NativeFeatures::new(),
            clock: 0,
            slice_end: 0,
            stop: None,
            bus_error_pending: false,
            timeslice_end: false,
            sink: None,
            trace_memory: false,
            trace_instructions: false,
            trace_io: false,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.cfg
    }

    /// Cycles elapsed since reset, as advanced by the run loop.
    pub fn cycles(&self) -> u64 {
        self.clock
    }

    pub fn mem(&self) -> &MemoryMap {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemoryMap {
        &mut self.mem
    }

    pub fn natfeat_mut(&mut self) -> &mut NativeFeatures {
        &mut self.natfeat
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sink = Some(sink);
    }

    pub fn set_trace_memory(&mut self, enable: bool) {
        self.trace_memory = enable;
    }

    pub fn set_trace_instructions(&mut self, enable: bool) {
        self.trace_instructions = enable;
    }

    pub fn set_trace_io(&mut self, enable: bool) {
        self.trace_io = enable;
    }

    pub fn set_device_debug(&mut self, slot: u8, enable: bool) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            s.debug = enable;
        }
    }

    pub(crate) fn advance(&mut self, cycles: u64) {
        self.clock += cycles;
    }

    pub(crate) fn begin_timeslice(&mut self, slice_end: u64) {
        self.timeslice_end = false;
        self.slice_end = slice_end;
    }

    fn device_ctx(&mut self, slot: u8, ipl: u8) -> DeviceCtx<'_> {
        DeviceCtx {
            slot,
            now: self.clock,
            cycle_rate: self.cfg.cycle_rate,
            ipl,
            slice_end: self.slice_end,
            timeslice_end: &mut self.timeslice_end,
            sched: &mut self.sched,
            irq: &mut self.irq,
        }
    }

    pub(crate) fn earliest_deadline(&mut self) -> Option<u64> {
        self.sched.earliest_deadline()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop.as_ref()
    }

    pub fn clear_stop(&mut self) {
        self.stop = None;
    }

    /// Request a loop exit; the first reason sticks. Ends the timeslice so
    /// the CPU hands control back after the current instruction.
    pub fn request_stop(&mut self, reason: StopReason) {
        if self.stop.is_none() {
            self.stop = Some(reason);
        }
        self.timeslice_end = true;
    }

    pub fn fatal(&mut self, err: CoreError) {
        log::error!("fatal: {err}");
        self.request_stop(StopReason::Fatal(err.to_string()));
    }

    fn emit(&mut self, kind: TraceKind, addr: u32, width: u8, value: u32) {
        if let Some(sink) = &mut self.sink {
            sink.record(
                self.clock,
                &TraceRecord {
                    kind,
                    addr,
                    width,
                    value,
                },
            );
        }
    }

    // ---- mapping ----

    pub fn add_memory(
        &mut self,
        base: u32,
        size: u32,
        writable: bool,
        initial: Option<&[u8]>,
    ) -> Result<()> {
        self.mem.add_memory(base, size, writable, initial)?;
        let flavor = if writable { MAP_RAM } else { MAP_ROM };
        self.emit(TraceKind::Map, base, 0, flavor);
        Ok(())
    }

    pub fn remove_memory(&mut self, base: u32) -> Result<()> {
        let (_, writable) = self.mem.remove_memory(base)?;
        let flavor = if writable { MAP_RAM } else { MAP_ROM };
        self.emit(TraceKind::Unmap, base, 0, flavor);
        Ok(())
    }

    pub fn move_memory(&mut self, src: u32, dst: u32) -> Result<()> {
        self.mem.move_memory(src, dst)?;
        self.emit(TraceKind::Move, src, 0, dst);
        Ok(())
    }

    /// Map a device window at `base` with the interrupt level it may assert
    /// (0 for none). Returns the slot id. The device is reset into its
    /// power-on state as part of registration.
    pub fn add_device(&mut self, dev: Box<dyn Device>, base: u32, ipl: u8) -> Result<u8> {
        if self.slots.len() >= NUM_DEVICE_SLOTS {
            return Err(CoreError::SlotsExhausted { base });
        }
        let slot = self.slots.len() as u8;
        let len = dev.window().max(1);
        let (aligned_base, _) = self.mem.map_device(base, len, slot)?;
        self.slots.push(DeviceSlot {
            name: dev.name().to_string(),
            dev: Some(dev),
            base,
            len,
            ipl,
            debug: false,
        });
        self.emit(TraceKind::Map, aligned_base, 0, MAP_DEVICE);
        self.reset_device(slot)?;
        Ok(slot)
    }

    pub fn device_name(&self, slot: u8) -> Option<&str> {
        self.slots.get(slot as usize).map(|s| s.name.as_str())
    }

    /// Reset every device: lines dropped, callbacks cancelled, registers
    /// back to power-on state.
    pub fn reset_devices(&mut self) -> Result<()> {
        for slot in 0..self.slots.len() as u8 {
            self.reset_device(slot)?;
        }
        Ok(())
    }

    fn reset_device(&mut self, slot: u8) -> Result<()> {
        let idx = slot as usize;
        self.sched.cancel_all_for(slot);
        self.irq.set_level(slot, 0);
        let Some(mut dev) = self.slots[idx].dev.take() else {
            return Ok(());
        };
        let ipl = self.slots[idx].ipl;
        let res = dev.reset(&mut self.device_ctx(slot, ipl));
        self.slots[idx].dev = Some(dev);
        res
    }

    /// Run every scheduled callback whose deadline has been reached.
    pub fn run_due(&mut self) -> Result<()> {
        while let Some((slot, tag)) = self.sched.pop_due(self.clock) {
            self.dispatch_tick(slot, &tag)?;
        }
        Ok(())
    }

    fn dispatch_tick(&mut self, slot: u8, tag: &str) -> Result<()> {
        let idx = slot as usize;
        let Some(mut dev) = self.slots.get_mut(idx).and_then(|s| s.dev.take()) else {
            return Ok(());
        };
        let ipl = self.slots[idx].ipl;
        let res = dev.tick(&mut self.device_ctx(slot, ipl), tag);
        self.slots[idx].dev = Some(dev);
        res
    }

    /// Borrow a registered device with a live context, e.g. to feed console
    /// input between quanta. `None` if the slot or type does not match.
    pub fn with_device<T: Device, R>(
        &mut self,
        slot: u8,
        f: impl FnOnce(&mut T, &mut DeviceCtx<'_>) -> R,
    ) -> Option<R> {
        let idx = slot as usize;
        let mut dev = self.slots.get_mut(idx)?.dev.take()?;
        let ipl = self.slots[idx].ipl;
        let result = match dev.as_any_mut().downcast_mut::<T>() {
            Some(typed) => Some(f(typed, &mut self.device_ctx(slot, ipl))),
            None => None,
        };
        self.slots[idx].dev = Some(dev);
        result
    }

    // ---- access paths ----

    fn device_at(&self, addr: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.contains(addr))
    }

    fn device_read(&mut self, addr: u32, width: Width) -> DevOutcome {
        let Some(idx) = self.device_at(addr) else {
            return DevOutcome::NotDecoded;
        };
        let Some(mut dev) = self.slots[idx].dev.take() else {
            return DevOutcome::NotDecoded;
        };
        let base = self.slots[idx].base;
        let ipl = self.slots[idx].ipl;
        let offset = addr - base;
        let res = dev.read(&mut self.device_ctx(idx as u8, ipl), offset, width);
        self.slots[idx].dev = Some(dev);
        match res {
            Ok(Some(value)) => {
                let value = value & width.mask();
                if self.trace_io {
                    self.emit(TraceKind::DevRead, addr, width.bits(), value);
                }
                if self.slots[idx].debug {
                    self.log_register(idx, offset, width, value, false);
                }
                DevOutcome::Value(value)
            }
            Ok(None) => DevOutcome::NotDecoded,
            Err(e) => {
                self.fatal(e);
                DevOutcome::Failed
            }
        }
    }

    fn device_write(&mut self, addr: u32, width: Width, value: u32) -> DevOutcome {
        let Some(idx) = self.device_at(addr) else {
            return DevOutcome::NotDecoded;
        };
        let Some(mut dev) = self.slots[idx].dev.take() else {
            return DevOutcome::NotDecoded;
        };
        let base = self.slots[idx].base;
        let ipl = self.slots[idx].ipl;
        let offset = addr - base;
        let value = value & width.mask();
        let res = dev.write(&mut self.device_ctx(idx as u8, ipl), offset, width, value);
        self.slots[idx].dev = Some(dev);
        match res {
            Ok(true) => {
                if self.trace_io {
                    self.emit(TraceKind::DevWrite, addr, width.bits(), value);
                }
                if self.slots[idx].debug {
                    self.log_register(idx, offset, width, value, true);
                }
                DevOutcome::Value(0)
            }
            Ok(false) => DevOutcome::NotDecoded,
            Err(e) => {
                self.fatal(e);
                DevOutcome::Failed
            }
        }
    }

    fn log_register(&self, idx: usize, offset: u32, width: Width, value: u32, write: bool) {
        let slot = &self.slots[idx];
        let reg = slot
            .dev
            .as_ref()
            .and_then(|d| d.registers())
            .and_then(|m| m.lookup(offset, width, write))
            .map(|r| r.name.to_string())
            .unwrap_or_else(|| format!("+{offset:#x}"));
        let arrow = if write { "<-" } else { "->" };
        log::debug!(target: "device", "{}.{} {} {:#x}", slot.name, reg, arrow, value);
    }

    fn invalid_read(&mut self, addr: u32, width: Width) -> u32 {
        if self.cfg.bus_error {
            self.bus_error_pending = true;
            self.timeslice_end = true;
        }
        log::warn!("bad read {:#010x}/{}", addr, width.bits());
        self.emit(TraceKind::InvalidRead, addr, width.bits(), !0);
        0
    }

    fn invalid_write(&mut self, addr: u32, width: Width, value: u32) {
        if self.cfg.bus_error {
            self.bus_error_pending = true;
            self.timeslice_end = true;
        }
        log::warn!(
            "bad write {:#010x} <- {:#x}/{}",
            addr,
            value & width.mask(),
            width.bits()
        );
        self.emit(TraceKind::InvalidWrite, addr, width.bits(), value & width.mask());
    }

    fn misaligned(&self, addr: u32, width: Width) -> bool {
        self.cfg.bus_error
            && self.cfg.fault_on_misaligned
            && width != Width::Byte
            && addr & 1 != 0
    }

    fn read_traced(&mut self, addr: u32, width: Width, trace: bool) -> u32 {
        if self.misaligned(addr, width) {
            return self.invalid_read(addr, width);
        }
        match self.mem.classify(addr) {
            PageKind::Buffer => match self.mem.buffer_read(addr, width) {
                Some(value) => {
                    if trace && self.trace_memory {
                        self.emit(TraceKind::Read, addr, width.bits(), value);
                    }
                    value
                }
                None => self.invalid_read(addr, width),
            },
            PageKind::Device { .. } => match self.device_read(addr, width) {
                DevOutcome::Value(v) => v,
                DevOutcome::NotDecoded => self.invalid_read(addr, width),
                DevOutcome::Failed => 0,
            },
            PageKind::Invalid => self.invalid_read(addr, width),
        }
    }

    fn write_traced(&mut self, addr: u32, width: Width, value: u32) {
        if self.misaligned(addr, width) {
            return self.invalid_write(addr, width, value);
        }
        match self.mem.classify(addr) {
            PageKind::Buffer => {
                if self.mem.buffer_write(addr, width, value) {
                    if self.trace_memory {
                        self.emit(TraceKind::Write, addr, width.bits(), value & width.mask());
                    }
                } else {
                    self.invalid_write(addr, width, value);
                }
            }
            PageKind::Device { .. } => match self.device_write(addr, width, value) {
                DevOutcome::Value(_) | DevOutcome::Failed => {}
                DevOutcome::NotDecoded => self.invalid_write(addr, width, value),
            },
            PageKind::Invalid => self.invalid_write(addr, width, value),
        }
    }
}

impl CpuBus for Bus {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read_traced(addr, Width::Byte, true) as u8
    }

    fn read16(&mut self, addr: u32) -> u16 {
        self.read_traced(addr, Width::Word, true) as u16
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.read_traced(addr, Width::Long, true)
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.write_traced(addr, Width::Byte, value as u32);
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.write_traced(addr, Width::Word, value as u32);
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.write_traced(addr, Width::Long, value);
    }

    fn read_instr_16(&mut self, addr: u32) -> u16 {
        self.read_traced(addr, Width::Word, false) as u16
    }

    fn read_instr_32(&mut self, addr: u32) -> u32 {
        self.read_traced(addr, Width::Long, false)
    }

    fn read_disasm_16(&self, addr: u32) -> u16 {
        self.mem.read_disasm_16(addr)
    }

    fn read_disasm_32(&self, addr: u32) -> u32 {
        self.mem.read_disasm_32(addr)
    }

    fn instr_fetch(&mut self, pc: u32) {
        if self.trace_instructions {
            self.emit(TraceKind::Instr, pc, 0, 0);
        }
    }

    fn irq_level(&self) -> u8 {
        self.irq.pending_level()
    }

    fn ack_irq(&mut self, level: u8) -> u8 {
        let Some(slot) = self.irq.acknowledge(level) else {
            log::debug!(target: "irq", "spurious interrupt at level {level}");
            return VECTOR_SPURIOUS;
        };
        let idx = slot as usize;
        let Some(mut dev) = self.slots[idx].dev.take() else {
            return VECTOR_SPURIOUS;
        };
        let ipl = self.slots[idx].ipl;
        let vector = dev.vector(&mut self.device_ctx(slot, ipl), level);
        self.slots[idx].dev = Some(dev);
        let vector = vector.unwrap_or_else(|| autovector(level));
        log::debug!(
            target: "irq",
            "level {} acknowledged by {}, vector {}",
            level,
            self.slots[idx].name,
            vector
        );
        vector
    }

    fn illegal_instruction(
        &mut self,
        regs: &mut dyn CpuRegs,
        _pc: u32,
        opcode: u16,
    ) -> IllegalOutcome {
        match self.natfeat.dispatch(regs, &self.mem, opcode) {
            Ok(NatOutcome::Handled) => IllegalOutcome::Handled,
            Ok(NatOutcome::Shutdown) => {
                self.request_stop(StopReason::ShutdownRequested);
                IllegalOutcome::Handled
            }
            Ok(NatOutcome::NotHandled) => IllegalOutcome::Fault,
            Err(e) => {
                self.fatal(e);
                IllegalOutcome::Fault
            }
        }
    }

    fn reset_instruction(&mut self) {
        log::info!("guest executed RESET");
        if let Err(e) = self.reset_devices() {
            self.fatal(e);
        }
        self.timeslice_end = true;
    }

    fn take_bus_error(&mut self) -> bool {
        std::mem::take(&mut self.bus_error_pending)
    }

    fn timeslice_ended(&self) -> bool {
        self.timeslice_end
    }
}
