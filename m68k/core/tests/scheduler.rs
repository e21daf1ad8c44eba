//! Callback scheduling observed through the full loop: ordering,
//! replacement, quantum trimming.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Op, ScriptedCpu};
use m68k_core::device::{Device, DeviceCtx};
use m68k_core::mem::Width;
use m68k_core::{Emulator, EmulatorConfig, Result, StopReason};

/// Register block: writing (tag_index, delay) schedules; firing logs the
/// tag and the cycle it ran at.
struct CallbackLab {
    fired: Rc<RefCell<Vec<(String, u64)>>>,
    /// `(tag, deadline)` pairs applied at reset.
    at_reset: Vec<(String, u64)>,
}

impl CallbackLab {
    fn boxed(fired: Rc<RefCell<Vec<(String, u64)>>>, at_reset: Vec<(String, u64)>) -> Box<Self> {
        Box::new(Self { fired, at_reset })
    }
}

impl Device for CallbackLab {
    fn name(&self) -> &str {
        "cblab"
    }

    fn window(&self) -> u32 {
        0x10
    }

    fn reset(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<()> {
        for (tag, deadline) in &self.at_reset {
            ctx.schedule_at(tag, *deadline)?;
        }
        Ok(())
    }

    fn read(&mut self, _ctx: &mut DeviceCtx<'_>, _offset: u32, _width: Width) -> Result<Option<u32>> {
        Ok(Some(0))
    }

    /// offset selects the tag (`t<offset>`), the value is the deadline.
    fn write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> Result<bool> {
        ctx.schedule_at(&format!("t{offset}"), value as u64)?;
        Ok(true)
    }

    fn tick(&mut self, ctx: &mut DeviceCtx<'_>, tag: &str) -> Result<()> {
        self.fired.borrow_mut().push((tag.to_string(), ctx.now()));
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn lab_emulator(at_reset: Vec<(String, u64)>) -> (Emulator, Rc<RefCell<Vec<(String, u64)>>>) {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let cpu = ScriptedCpu::new(vec![]);
    let mut emu = Emulator::new(
        EmulatorConfig {
            cycle_limit: Some(200_000),
            ..EmulatorConfig::default()
        },
        Box::new(cpu),
    );
    emu.bus_mut().add_memory(0, 0x1000, true, None).unwrap();
    emu.bus_mut()
        .add_device(CallbackLab::boxed(fired.clone(), at_reset), 0xff0000, 0)
        .unwrap();
    (emu, fired)
}

#[test]
fn callbacks_fire_in_deadline_order_and_on_time() {
    let (mut emu, fired) = lab_emulator(vec![
        ("late".into(), 30_000),
        ("early".into(), 5_000),
        ("mid".into(), 12_000),
    ]);
    assert_eq!(emu.run(), StopReason::CycleLimit);

    let fired = fired.borrow();
    let names: Vec<&str> = fired.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["early", "mid", "late"]);
    for (name, at) in fired.iter() {
        let deadline = match name.as_str() {
            "early" => 5_000,
            "mid" => 12_000,
            _ => 30_000,
        };
        assert!(*at >= deadline, "{name} fired early at {at}");
        // never more than one quantum late; the loop trims the slice to the
        // deadline so the real slack is one instruction
        assert!(*at < deadline + 8_000, "{name} fired late at {at}");
    }
}

#[test]
fn rescheduling_a_tag_fires_once_at_the_later_deadline() {
    // the guest writes the same tag twice: deadline 100, then 20_000
    let fired = Rc::new(RefCell::new(Vec::new()));
    let cpu = ScriptedCpu::new(vec![
        Op::Write32(0xff0000, 100),
        Op::Write32(0xff0000, 20_000),
    ]);
    let mut emu = Emulator::new(
        EmulatorConfig {
            cycle_limit: Some(100_000),
            ..EmulatorConfig::default()
        },
        Box::new(cpu),
    );
    emu.bus_mut().add_memory(0, 0x1000, true, None).unwrap();
    emu.bus_mut()
        .add_device(CallbackLab::boxed(fired.clone(), vec![]), 0xff0000, 0)
        .unwrap();
    assert_eq!(emu.run(), StopReason::CycleLimit);

    let fired = fired.borrow();
    assert_eq!(fired.len(), 1, "replaced deadline fires exactly once");
    let (name, at) = &fired[0];
    assert_eq!(name, "t0");
    assert!(*at >= 20_000);
}

#[test]
fn quantum_is_trimmed_to_the_next_deadline() {
    // deadline far below the default quantum: the callback must not slip a
    // whole quantum
    let (mut emu, fired) = lab_emulator(vec![("t".into(), 1_000)]);
    while fired.borrow().is_empty() {
        emu.step_quantum();
    }
    let (_, at) = fired.borrow()[0].clone();
    assert!((1_000..1_100).contains(&at), "fired at {at}");
}
