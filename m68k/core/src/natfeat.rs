//! Native features: the illegal-instruction protocol through which guest
//! code requests host services.
//!
//! Two reserved opcodes carry the protocol: `0x7300` resolves a feature name
//! to an id, `0x7301` calls a feature by id. Arguments sit on the stack
//! above the trap frame slot (`SP + 4`), results travel in D0. Guest memory
//! is read through the non-faulting peek path so a garbage pointer cannot
//! itself raise a bus error mid-dispatch.

use std::io::Write;

use crate::cpu::{CpuRegs, Reg};
use crate::mem::{MemoryMap, Width};
use crate::Result;

pub const NATFEAT_ID_OPCODE: u16 = 0x7300;
pub const NATFEAT_CALL_OPCODE: u16 = 0x7301;

const FEAT_VERSION: u32 = 1;
const FEAT_STDERR: u32 = 2;
const FEAT_SHUTDOWN: u32 = 3;

/// Protocol version reported for `NF_VERSION` calls.
const VERSION: u32 = 1;

/// Guest strings are capped so a missing terminator cannot run away.
const MAX_STRING: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatOutcome {
    /// Consumed; the CPU skips the opcode and resumes.
    Handled,
    /// Not a native-features request; take the illegal-instruction exception.
    NotHandled,
    /// Consumed, and the guest asked the emulator to exit.
    Shutdown,
}

pub struct NativeFeatures {
    stderr: Box<dyn Write>,
}

impl Default for NativeFeatures {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeFeatures {
    pub fn new() -> Self {
        Self {
            stderr: Box::new(std::io::stderr()),
        }
    }

    /// Redirect `NF_STDERR` output, e.g. into a buffer under test.
    pub fn set_stderr(&mut self, sink: Box<dyn Write>) {
        self.stderr = sink;
    }

    pub fn dispatch(
        &mut self,
        regs: &mut dyn CpuRegs,
        mem: &MemoryMap,
        opcode: u16,
    ) -> Result<NatOutcome> {
        let argptr = regs.get_reg(Reg::SP).wrapping_add(4);
        match opcode {
            NATFEAT_ID_OPCODE => Ok(self.feature_id(regs, mem, argptr)),
            NATFEAT_CALL_OPCODE => self.feature_call(regs, mem, argptr),
            _ => Ok(NatOutcome::NotHandled),
        }
    }

    fn feature_id(&self, regs: &mut dyn CpuRegs, mem: &MemoryMap, argptr: u32) -> NatOutcome {
        let Some(name) = read_guest_string(mem, argptr) else {
            return NatOutcome::NotHandled;
        };
        let id = match name.as_str() {
            "NF_VERSION" => FEAT_VERSION,
            "NF_STDERR" => FEAT_STDERR,
            "NF_SHUTDOWN" => FEAT_SHUTDOWN,
            _ => return NatOutcome::NotHandled,
        };
        regs.set_reg(Reg::D0, id);
        NatOutcome::Handled
    }

    fn feature_call(
        &mut self,
        regs: &mut dyn CpuRegs,
        mem: &MemoryMap,
        argptr: u32,
    ) -> Result<NatOutcome> {
        let Some(id) = mem.peek(argptr, Width::Long) else {
            return Ok(NatOutcome::NotHandled);
        };
        match id {
            FEAT_VERSION => {
                regs.set_reg(Reg::D0, VERSION);
                Ok(NatOutcome::Handled)
            }
            FEAT_STDERR => {
                let Some(msg) = read_guest_string(mem, argptr.wrapping_add(4)) else {
                    return Ok(NatOutcome::NotHandled);
                };
                self.stderr.write_all(msg.as_bytes())?;
                self.stderr.flush()?;
                Ok(NatOutcome::Handled)
            }
            FEAT_SHUTDOWN => Ok(NatOutcome::Shutdown),
            _ => Ok(NatOutcome::NotHandled),
        }
    }
}

/// Follow a pointer slot to a zero-terminated guest string. `None` when the
/// slot or any byte of the string is unmapped.
fn read_guest_string(mem: &MemoryMap, slot: u32) -> Option<String> {
    let mut ptr = mem.peek(slot, Width::Long)?;
    let mut out = String::new();
    loop {
        let byte = mem.peek(ptr, Width::Byte)? as u8;
        if byte == 0 || out.len() >= MAX_STRING {
            return Some(out);
        }
        out.push(byte as char);
        ptr = ptr.wrapping_add(1);
    }
}
