//! The seam between the bus fabric and an external CPU interpreter.
//!
//! The execution engine (Musashi behind FFI, or a scripted stand-in under
//! test) implements [`Cpu`] and drives all memory traffic through the
//! [`CpuBus`] it is handed. Fault and timeslice conditions travel the other
//! way as pulled signals: the stepper is expected to check
//! [`CpuBus::take_bus_error`] after every access and
//! [`CpuBus::timeslice_ended`] at instruction boundaries, and to sample
//! [`CpuBus::irq_level`] against its interrupt mask at instruction
//! boundaries.

use serde::{Deserialize, Serialize};

/// CPU registers addressable through the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reg {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    PC,
    SR,
    /// The active stack pointer (aliases A7).
    SP,
    USP,
    ISP,
    VBR,
}

/// Emulated CPU model. Only affects defaults (alignment faulting) and the
/// disassembler flavour, never the bus fabric itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuModel {
    #[serde(rename = "68000")]
    M68000,
    #[serde(rename = "68010")]
    M68010,
    #[serde(rename = "68020")]
    M68020,
    #[serde(rename = "68030")]
    M68030,
    #[serde(rename = "68040")]
    M68040,
}

impl CpuModel {
    pub const DEFAULT: Self = Self::M68000;

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "68000" => Some(Self::M68000),
            "68010" => Some(Self::M68010),
            "68020" => Some(Self::M68020),
            "68030" => Some(Self::M68030),
            "68040" => Some(Self::M68040),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M68000 => "68000",
            Self::M68010 => "68010",
            Self::M68020 => "68020",
            Self::M68030 => "68030",
            Self::M68040 => "68040",
        }
    }

    /// Whether word/long accesses to odd addresses fault on this model.
    pub fn faults_on_misaligned(self) -> bool {
        matches!(self, Self::M68000 | Self::M68010)
    }
}

/// Register-file access, implemented by the CPU and lent to bus-side hooks
/// (the native-features dispatcher reads SP and writes D0 through this).
pub trait CpuRegs {
    fn get_reg(&self, reg: Reg) -> u32;
    fn set_reg(&mut self, reg: Reg, value: u32);
}

/// Outcome of offering an illegal instruction to the bus-side hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IllegalOutcome {
    /// The hook consumed the instruction. The CPU must advance PC past the
    /// 2-byte opcode and resume without taking the exception.
    Handled,
    /// Not an emulator service: deliver the illegal-instruction exception.
    Fault,
}

/// The bus as the CPU sees it.
pub trait CpuBus {
    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;
    fn write8(&mut self, addr: u32, value: u8);
    fn write16(&mut self, addr: u32, value: u16);
    fn write32(&mut self, addr: u32, value: u32);

    /// Opcode/extension-word fetches. Full bus semantics including faults,
    /// but excluded from memory tracing.
    fn read_instr_16(&mut self, addr: u32) -> u16;
    fn read_instr_32(&mut self, addr: u32) -> u32;

    /// Reads for the disassembler: no devices, no traces, no faults.
    fn read_disasm_16(&self, addr: u32) -> u16;
    fn read_disasm_32(&self, addr: u32) -> u32;

    /// Instruction boundary notification, used for instruction tracing.
    fn instr_fetch(&mut self, pc: u32);

    /// Level currently on the IPL pins. Sample at instruction boundaries.
    fn irq_level(&self) -> u8;

    /// Interrupt-acknowledge cycle for `level`; returns the vector byte.
    fn ack_irq(&mut self, level: u8) -> u8;

    /// Offer an illegal instruction to the emulator before taking the
    /// exception. `regs` must expose at least SP, PC and D0.
    fn illegal_instruction(
        &mut self,
        regs: &mut dyn CpuRegs,
        pc: u32,
        opcode: u16,
    ) -> IllegalOutcome;

    /// The guest executed a RESET instruction.
    fn reset_instruction(&mut self);

    /// True once if the last access faulted; the CPU takes the bus-error
    /// (or, per model, address-error) exception.
    fn take_bus_error(&mut self) -> bool;

    /// The bus wants control back: finish the current instruction and
    /// return from `execute`.
    fn timeslice_ended(&self) -> bool;
}

/// An external CPU interpreter.
pub trait Cpu: CpuRegs {
    /// Hard-reset the execution state, fetching the initial SSP/PC from the
    /// exception table at address 0.
    fn reset(&mut self, bus: &mut dyn CpuBus);

    /// Run for at most `cycles` cycles and return the count actually
    /// consumed (at most `cycles`, less when the timeslice is ended early).
    fn execute(&mut self, bus: &mut dyn CpuBus, cycles: u64) -> u64;

    /// Disassemble one instruction at `pc` through the non-perturbing read
    /// path. Returns the text and the instruction length in bytes.
    fn disassemble(&mut self, bus: &dyn CpuBus, pc: u32) -> Option<(String, u32)> {
        let _ = (bus, pc);
        None
    }
}
