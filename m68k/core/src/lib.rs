//! Emulator core for M68K-family microcomputers.
//!
//! This crate supplies everything around the CPU interpreter: a page-mapped
//! 32-bit memory bus with RAM/ROM regions and memory-mapped devices, a device
//! framework with cycle-deadline callbacks and prioritized interrupt lines,
//! the quantum-based run loop that keeps all of it consistent, and a small
//! catalogue of reference peripherals.
//!
//! The CPU itself is an external collaborator consumed through the [`Cpu`]
//! trait; a Musashi FFI binding or any other stepper that honours the
//! [`CpuBus`] contract plugs in unchanged.

pub mod bus;
pub mod cpu;
pub mod device;
pub mod devices;
pub mod emulator;
pub mod irq;
pub mod mem;
pub mod natfeat;
pub mod sched;
pub mod symbols;
pub mod trace;

#[cfg(feature = "perfetto")]
pub mod perfetto;

use thiserror::Error;

pub use bus::{Bus, BusConfig};
pub use cpu::{Cpu, CpuBus, CpuModel, CpuRegs, IllegalOutcome, Reg};
pub use device::{Device, DeviceCtx, RegAccess, RegisterMap};
pub use emulator::{Emulator, EmulatorConfig, StopReason};
pub use mem::{MemoryMap, Width, PAGE_SIZE};
pub use symbols::SymbolTable;
pub use trace::{TextTrace, TraceKind, TraceRecord, TraceSink};

#[cfg(feature = "perfetto")]
pub use perfetto::PerfettoTrace;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range {base:#010x}+{size:#x} is not page aligned")]
    Misaligned { base: u32, size: u32 },
    #[error("range {base:#010x}+{size:#x} overlaps an existing mapping")]
    Overlap { base: u32, size: u32 },
    #[error("no free mapping slot for {base:#010x}")]
    SlotsExhausted { base: u32 },
    #[error("{addr:#010x} is not the base of a mapped region")]
    NotRegionBase { addr: u32 },
    #[error("device {device}: {msg}")]
    Device { device: String, msg: String },
    #[error("callback '{tag}' set for cycle {deadline} which is not after cycle {now}")]
    CallbackInPast {
        tag: String,
        deadline: u64,
        now: u64,
    },
    #[error("bad configuration: {0}")]
    Config(String),
}

impl CoreError {
    /// Shorthand for device-originated failures.
    pub fn device(device: &str, msg: impl Into<String>) -> Self {
        CoreError::Device {
            device: device.to_string(),
            msg: msg.into(),
        }
    }
}
