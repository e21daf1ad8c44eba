//! The run loop.
//!
//! Execution proceeds in quanta: the CPU runs for a bounded number of
//! cycles, the global clock advances by what it actually consumed, and every
//! callback whose deadline has been reached fires before the next quantum
//! starts. The quantum is trimmed so no callback can be late by more than
//! one CPU step.

use serde::{Deserialize, Serialize};

use crate::bus::{Bus, BusConfig};
use crate::cpu::{Cpu, CpuModel, Reg};
use crate::symbols::SymbolTable;
use crate::Result;

/// Why the loop exited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The guest asked to power off (NF_SHUTDOWN).
    ShutdownRequested,
    /// The configured cycle budget ran out.
    CycleLimit,
    /// The embedding process requested a stop.
    UserBreak,
    /// An internal error; the cause is attached.
    Fatal(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub model: CpuModel,
    /// CPU clock in Hz.
    pub cycle_rate: u64,
    /// Cycles per quantum; 0 selects ~1ms of emulated time.
    pub quantum: u64,
    /// Stop after this many cycles, if set.
    pub cycle_limit: Option<u64>,
    pub bus_error: bool,
    /// On reset, restore memory regions to their initial contents.
    pub reset_contents: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::DEFAULT,
            cycle_rate: 8_000_000,
            quantum: 0,
            cycle_limit: None,
            bus_error: true,
            reset_contents: false,
        }
    }
}

impl EmulatorConfig {
    fn bus_config(&self) -> BusConfig {
        BusConfig {
            cycle_rate: self.cycle_rate,
            bus_error: self.bus_error,
            fault_on_misaligned: self.model.faults_on_misaligned(),
        }
    }

    fn quantum_cycles(&self) -> u64 {
        if self.quantum == 0 {
            (self.cycle_rate / 1000).max(1)
        } else {
            self.quantum
        }
    }
}

pub struct Emulator {
    cfg: EmulatorConfig,
    cpu: Box<dyn Cpu>,
    bus: Bus,
    symbols: SymbolTable,
}

impl Emulator {
    pub fn new(cfg: EmulatorConfig, cpu: Box<dyn Cpu>) -> Self {
        let bus = Bus::new(cfg.bus_config());
        Self {
            cfg,
            cpu,
            bus,
            symbols: SymbolTable::new(),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.cfg
    }

    pub fn get_reg(&self, reg: Reg) -> u32 {
        self.cpu.get_reg(reg)
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.cpu.set_reg(reg, value);
    }

    pub fn add_symbols<I>(&mut self, image: &str, symbols: I)
    where
        I: IntoIterator<Item = (String, u32, u32)>,
    {
        self.symbols.add_image(image, symbols);
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Reset sequence: memory contents (optionally), every device, then the
    /// CPU. The page table itself is left alone.
    pub fn reset(&mut self) -> Result<()> {
        if self.cfg.reset_contents {
            self.bus.mem_mut().reset_contents();
        }
        self.bus.reset_devices()?;
        let Self { cpu, bus, .. } = self;
        cpu.reset(bus);
        Ok(())
    }

    /// One quantum: run the CPU up to the next callback deadline (bounded by
    /// the configured quantum), advance the clock, fire what came due.
    /// Returns the cycles consumed.
    pub fn step_quantum(&mut self) -> u64 {
        let now = self.bus.cycles();
        let budget = now.saturating_add(self.cfg.quantum_cycles());
        let deadline = match self.bus.earliest_deadline() {
            Some(d) => d.min(budget),
            None => budget,
        };
        let slice = deadline.saturating_sub(now).max(1);
        self.bus.begin_timeslice(now + slice);

        let Self { cpu, bus, .. } = self;
        let used = cpu.execute(bus, slice).min(slice);
        // a stepper reporting no progress would wedge the clock; bill it the
        // whole slice, as a halted CPU would be
        let used = if used == 0 { slice } else { used };
        self.bus.advance(used);

        if let Err(e) = self.bus.run_due() {
            self.bus.fatal(e);
        }
        if let Some(limit) = self.cfg.cycle_limit {
            if self.bus.cycles() >= limit && self.bus.stop_reason().is_none() {
                self.bus.request_stop(StopReason::CycleLimit);
            }
        }
        used
    }

    /// Run quanta until something requests a stop.
    pub fn run(&mut self) -> StopReason {
        loop {
            self.step_quantum();
            if let Some(reason) = self.bus.stop_reason() {
                return reason.clone();
            }
        }
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.bus.stop_reason()
    }

    /// Stop from the embedding process (console ^C and friends).
    pub fn request_stop(&mut self) {
        self.bus.request_stop(StopReason::UserBreak);
    }

    /// Disassemble `count` instructions starting at `addr`, symbolicating
    /// line addresses. Uses the non-perturbing read path throughout.
    pub fn disassemble(&mut self, addr: u32, count: usize) -> Vec<(u32, String)> {
        let Self {
            cpu, bus, symbols, ..
        } = self;
        let mut out = Vec::with_capacity(count);
        let mut pc = addr;
        for _ in 0..count {
            let Some((text, len)) = cpu.disassemble(&*bus, pc) else {
                break;
            };
            let line = match symbols.label(pc) {
                Some(label) => format!("{label}: {text}"),
                None => text,
            };
            out.push((pc, line));
            pc = pc.wrapping_add(len.max(2));
        }
        out
    }
}
