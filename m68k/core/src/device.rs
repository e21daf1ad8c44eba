//! The peripheral model.
//!
//! A device is a plain struct owning its register state. The bus hands every
//! handler a [`DeviceCtx`] for the services the old global framework used to
//! provide: the cycle clock, callback scheduling and the interrupt line.
//! Handlers answer `Ok(None)` / `Ok(false)` for offsets they do not decode;
//! the bus turns that into the invalid-access path.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::irq::IrqController;
use crate::mem::Width;
use crate::sched::Scheduler;
use crate::{CoreError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegAccess {
    R,
    W,
    RW,
}

impl RegAccess {
    pub fn readable(self) -> bool {
        matches!(self, RegAccess::R | RegAccess::RW)
    }

    pub fn writable(self) -> bool {
        matches!(self, RegAccess::W | RegAccess::RW)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegDef {
    pub name: &'static str,
    pub offset: u32,
    pub width: Width,
    pub access: RegAccess,
}

/// Declared register layout of a device. Drives the decoded window size and
/// names register-level trace lines; the device's own `read`/`write` do the
/// actual decoding.
#[derive(Clone, Debug, Default)]
pub struct RegisterMap {
    regs: Vec<RegDef>,
}

impl RegisterMap {
    pub fn new(regs: &[(&'static str, u32, Width, RegAccess)]) -> Self {
        Self {
            regs: regs
                .iter()
                .map(|&(name, offset, width, access)| RegDef {
                    name,
                    offset,
                    width,
                    access,
                })
                .collect(),
        }
    }

    pub fn lookup(&self, offset: u32, width: Width, write: bool) -> Option<&RegDef> {
        self.regs.iter().find(|r| {
            r.offset == offset
                && r.width == width
                && if write {
                    r.access.writable()
                } else {
                    r.access.readable()
                }
        })
    }

    /// Implied length of the decoded window in bytes.
    pub fn span(&self) -> u32 {
        self.regs
            .iter()
            .map(|r| r.offset + r.width.bytes())
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegDef> {
        self.regs.iter()
    }
}

/// Services available to device handlers while they run.
pub struct DeviceCtx<'a> {
    pub(crate) slot: u8,
    pub(crate) now: u64,
    pub(crate) cycle_rate: u64,
    pub(crate) ipl: u8,
    /// End of the timeslice currently executing, in cycles.
    pub(crate) slice_end: u64,
    /// Raised to hand control back to the loop before `slice_end`.
    pub(crate) timeslice_end: &'a mut bool,
    pub(crate) sched: &'a mut Scheduler,
    pub(crate) irq: &'a mut IrqController,
}

impl DeviceCtx<'_> {
    /// Cycles elapsed since reset.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// CPU clock in Hz.
    pub fn cycle_rate(&self) -> u64 {
        self.cycle_rate
    }

    /// Current time in microseconds since reset.
    pub fn now_micros(&self) -> u64 {
        self.now / self.cycles_per_micro()
    }

    pub fn cycles_per_micro(&self) -> u64 {
        (self.cycle_rate / 1_000_000).max(1)
    }

    /// Interrupt level this device was registered with, 0 if none.
    pub fn configured_ipl(&self) -> u8 {
        self.ipl
    }

    /// Run `tick(tag)` once the global clock reaches `deadline`. Re-using a
    /// tag replaces the earlier deadline.
    pub fn schedule_at(&mut self, tag: &str, deadline: u64) -> Result<()> {
        if deadline <= self.now {
            return Err(CoreError::CallbackInPast {
                tag: tag.to_string(),
                deadline,
                now: self.now,
            });
        }
        self.sched.schedule_at(self.slot, tag, deadline);
        // the loop sized this timeslice before the deadline existed; hand
        // control back early so the next quantum can honour it
        if deadline < self.slice_end {
            *self.timeslice_end = true;
        }
        Ok(())
    }

    pub fn schedule_after(&mut self, tag: &str, cycles: u64) -> Result<()> {
        self.schedule_at(tag, self.now.saturating_add(cycles.max(1)))
    }

    /// Cancelling a tag that is not scheduled is a no-op.
    pub fn cancel(&mut self, tag: &str) {
        self.sched.cancel(self.slot, tag);
    }

    /// Drive the interrupt line at the registered level. Idempotent.
    pub fn assert_ipl(&mut self) {
        if self.ipl == 0 {
            log::warn!("device slot {} asserts without an interrupt level", self.slot);
            return;
        }
        self.irq.set_level(self.slot, self.ipl);
    }

    pub fn deassert_ipl(&mut self) {
        self.irq.set_level(self.slot, 0);
    }

    pub fn ipl_asserted(&self) -> bool {
        self.irq.level_of(self.slot) != 0
    }
}

/// A memory-mapped peripheral.
///
/// `read`/`write` receive the offset from the device base and must not
/// assume page alignment. `Err` from any handler is a fatal emulator stop,
/// never a guest-visible fault; use the `Ok(None)` / `Ok(false)` decode
/// failure for those.
pub trait Device: Any {
    fn name(&self) -> &str;

    /// Declared register layout, when the device has a static one.
    fn registers(&self) -> Option<&RegisterMap> {
        None
    }

    /// Length of the decoded window in bytes. Defaults to the register
    /// map's span.
    fn window(&self) -> u32 {
        self.registers().map(|r| r.span()).unwrap_or(0)
    }

    /// Return to power-on register state. The framework has already cleared
    /// the interrupt line and cancelled outstanding callbacks.
    fn reset(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<()>;

    fn read(&mut self, ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>>;

    fn write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<bool>;

    /// Vector byte for an acknowledge at `level`; `None` selects the
    /// autovector.
    fn vector(&mut self, ctx: &mut DeviceCtx<'_>, level: u8) -> Option<u8> {
        let _ = (ctx, level);
        None
    }

    /// A callback scheduled under `tag` came due.
    fn tick(&mut self, ctx: &mut DeviceCtx<'_>, tag: &str) -> Result<()> {
        let _ = (ctx, tag);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
