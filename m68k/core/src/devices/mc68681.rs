//! MC68681 DUART with the on-chip counter/timer.
//!
//! Two asynchronous channels with the usual mode/status/command/buffer
//! register files, a programmable interrupt vector, and the counter/timer
//! run off the 3.6864 MHz crystal. Transmission is modelled with a shift
//! register and a holding register so back-to-back writes overlap the way
//! firmware expects; a byte "on the wire" completes through a scheduler
//! callback at roughly 38400 bps.
//!
//! Timer-mode reload changes only take effect at the next STOPCC/STARTCC
//! cycle, not at rollover as on silicon.

use std::collections::VecDeque;

use crate::device::{Device, DeviceCtx, RegAccess, RegisterMap};
use crate::devices::RegisterArrangement;
use crate::mem::Width;
use crate::Result;

const XTAL_HZ: f64 = 3_686_400.0;

// channel mode register 1
const MR1_FFULL_EN: u8 = 0x40;

// channel command register
const CTRL_CMD_MASK: u8 = 0xf0;
const CTRL_MRRST: u8 = 0x10;
const CTRL_RXRST: u8 = 0x20;
const CTRL_TXRST: u8 = 0x30;
const CTRL_TXDIS: u8 = 0x08;
const CTRL_TXEN: u8 = 0x04;
const CTRL_RXDIS: u8 = 0x02;
const CTRL_RXEN: u8 = 0x01;

// channel status register
const STATUS_TRANSMITTER_EMPTY: u8 = 0x08;
const STATUS_TRANSMITTER_READY: u8 = 0x04;
const STATUS_FIFO_FULL: u8 = 0x02;
const STATUS_RECEIVER_READY: u8 = 0x01;

// interrupt status/mask bits
const INT_TXRDY: u8 = 0x01;
const INT_RXRDY_FFULL: u8 = 0x02;
const INT_COUNTER: u8 = 0x08;

// auxiliary control register counter/timer modes
const MODE_MASK: u8 = 0x70;
const MODE_CTR_TXCA: u8 = 0x10;
const MODE_CTR_TXCB: u8 = 0x20;
const MODE_CTR_XTAL16: u8 = 0x30;
const MODE_TMR_XTAL: u8 = 0x60;
const MODE_TMR_XTAL16: u8 = 0x70;
const MODE_TMR: u8 = 0x40;

const CT_TAG: &str = "counter/timer";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuartPort {
    A,
    B,
}

impl DuartPort {
    fn tx_tag(self) -> &'static str {
        match self {
            DuartPort::A => "tsrA",
            DuartPort::B => "tsrB",
        }
    }
}

#[derive(Default)]
struct Channel {
    mr1: u8,
    mr2: u8,
    mr_alt: bool,
    rxfifo: VecDeque<u8>,
    output: VecDeque<u8>,
    rx_enable: bool,
    tx_enable: bool,
    tsr_empty: bool,
    thr_empty: bool,
}

impl Channel {
    fn reset(&mut self) {
        self.mr1 = 0;
        self.mr2 = 0;
        self.mr_alt = false;
        self.rxfifo.clear();
        self.rx_enable = false;
        self.tx_enable = false;
        self.tsr_empty = true;
        self.thr_empty = true;
    }

    fn read_mr(&mut self) -> u8 {
        if self.mr_alt {
            self.mr2
        } else {
            self.mr_alt = true;
            self.mr1
        }
    }

    fn write_mr(&mut self, value: u8) {
        if self.mr_alt {
            self.mr2 = value;
        } else {
            self.mr_alt = true;
            self.mr1 = value;
        }
    }

    fn read_sr(&self) -> u8 {
        let mut sr = 0;
        if self.tsr_empty {
            sr |= STATUS_TRANSMITTER_EMPTY;
        }
        if self.thr_empty {
            sr |= STATUS_TRANSMITTER_READY;
        }
        let rxcount = self.rxfifo.len();
        if rxcount > 0 {
            sr |= STATUS_RECEIVER_READY;
            if rxcount > 2 {
                sr |= STATUS_FIFO_FULL;
            }
        }
        sr
    }

    fn read_rb(&mut self) -> u8 {
        self.rxfifo.pop_front().unwrap_or(0xff)
    }

    fn write_cr(&mut self, value: u8) {
        if value & CTRL_RXDIS != 0 {
            self.rx_enable = false;
        } else if value & CTRL_RXEN != 0 {
            self.rx_enable = true;
        }
        if value & CTRL_TXDIS != 0 {
            self.tx_enable = false;
        } else if value & CTRL_TXEN != 0 {
            self.tx_enable = true;
        }
        match value & CTRL_CMD_MASK {
            CTRL_MRRST => self.mr_alt = false,
            CTRL_RXRST => {
                self.rx_enable = false;
                self.rxfifo.clear();
            }
            CTRL_TXRST => self.tx_enable = false,
            _ => {}
        }
    }

    /// This channel's contribution to the interrupt status register.
    fn isr_bits(&self) -> u8 {
        let mut isr = 0;
        if self.tx_enable {
            isr |= INT_TXRDY;
        }
        if self.rx_enable {
            let threshold = if self.mr1 & MR1_FFULL_EN != 0 { 2 } else { 0 };
            if self.rxfifo.len() > threshold {
                isr |= INT_RXRDY_FFULL;
            }
        }
        isr
    }
}

pub struct Mc68681 {
    regs: RegisterMap,
    arrangement: RegisterArrangement,
    a: Channel,
    b: Channel,
    imr: u8,
    ivr: u8,
    counter_pending: bool,
    mode: u8,
    scaler: f64,
    reload: u16,
    count: u16,
    counter_deadline: u64,
    timer_epoch: u64,
}

const READ_REGS: [&str; 16] = [
    "MRA", "SRA", "CSRA", "RBA", "IPCR", "ISR", "CUR", "CLR", "MRB", "SRB", "CSRB", "RBB", "IVR",
    "IPR", "STARTCC", "STOPCC",
];
const WRITE_REGS: [&str; 16] = [
    "MRA", "CSRA", "CRA", "TBA", "ACR", "IMR", "CTUR", "CTLR", "MRB", "CSRB", "CRB", "TBB", "IVR",
    "OPCR", "OPSET", "OPCLR",
];

impl Mc68681 {
    pub fn new(arrangement: RegisterArrangement) -> Self {
        let mut defs: Vec<(&'static str, u32, Width, RegAccess)> = Vec::new();
        for index in 0..16u32 {
            let (first, second) = arrangement.offsets(index);
            for offset in std::iter::once(first).chain(second) {
                defs.push((READ_REGS[index as usize], offset, Width::Byte, RegAccess::R));
                defs.push((WRITE_REGS[index as usize], offset, Width::Byte, RegAccess::W));
            }
        }
        Self {
            regs: RegisterMap::new(&defs),
            arrangement,
            a: Channel::default(),
            b: Channel::default(),
            imr: 0,
            ivr: 0x0f,
            counter_pending: false,
            mode: MODE_TMR_XTAL16,
            scaler: 16.0,
            reload: 1,
            count: 0,
            counter_deadline: 0,
            timer_epoch: 0,
        }
    }

    /// Feed received data into a channel, as the console does.
    pub fn push_input(&mut self, ctx: &mut DeviceCtx<'_>, port: DuartPort, bytes: &[u8]) {
        let ch = self.channel_mut(port);
        if ch.rx_enable {
            ch.rxfifo.extend(bytes);
        }
        self.update_ipl(ctx);
    }

    /// Drain a channel's transmitted bytes.
    pub fn take_output(&mut self, port: DuartPort) -> Vec<u8> {
        self.channel_mut(port).output.drain(..).collect()
    }

    fn channel_mut(&mut self, port: DuartPort) -> &mut Channel {
        match port {
            DuartPort::A => &mut self.a,
            DuartPort::B => &mut self.b,
        }
    }

    fn isr(&self) -> u8 {
        let mut isr = self.a.isr_bits() | (self.b.isr_bits() << 4);
        if self.counter_pending {
            isr |= INT_COUNTER;
        }
        isr
    }

    fn update_ipl(&mut self, ctx: &mut DeviceCtx<'_>) {
        if self.isr() & self.imr != 0 {
            ctx.assert_ipl();
        } else {
            ctx.deassert_ipl();
        }
    }

    fn write_tb(&mut self, ctx: &mut DeviceCtx<'_>, port: DuartPort, value: u8) -> Result<()> {
        let tx_cycles = (ctx.cycle_rate() / 5000).max(1);
        let ch = self.channel_mut(port);
        ch.output.push_back(value);
        if ch.tsr_empty {
            ch.tsr_empty = false;
            ctx.schedule_after(port.tx_tag(), tx_cycles)?;
        } else {
            ch.thr_empty = false;
        }
        self.update_ipl(ctx);
        Ok(())
    }

    fn tx_done(&mut self, ctx: &mut DeviceCtx<'_>, port: DuartPort) -> Result<()> {
        let tx_cycles = (ctx.cycle_rate() / 5000).max(1);
        let ch = self.channel_mut(port);
        ch.tsr_empty = true;
        if !ch.thr_empty {
            // holding register drops into the shift register
            ch.thr_empty = true;
            ch.tsr_empty = false;
            ctx.schedule_after(port.tx_tag(), tx_cycles)?;
        }
        self.update_ipl(ctx);
        Ok(())
    }

    fn write_acr(&mut self, ctx: &mut DeviceCtx<'_>, value: u8) {
        let mode = value & MODE_MASK;
        let cycle_ratio = ctx.cycle_rate() as f64 / XTAL_HZ;
        let scaler = match mode {
            // external clock inputs run at the 38400 bps channel rate
            MODE_CTR_TXCA | MODE_CTR_TXCB => cycle_ratio * 96.0,
            MODE_CTR_XTAL16 | MODE_TMR_XTAL16 => cycle_ratio * 16.0,
            MODE_TMR_XTAL => cycle_ratio,
            _ => {
                log::warn!(target: "duart", "counter/timer mode {mode:#04x} not supported");
                return;
            }
        };
        self.mode = mode;
        self.scaler = scaler;
        ctx.cancel(CT_TAG);
    }

    fn mode_is_timer(&self) -> bool {
        self.mode & MODE_TMR != 0
    }

    fn timer_period(&self) -> u64 {
        ((2.0 * self.reload as f64 * self.scaler) as u64).max(1)
    }

    fn counter_cycles(&self) -> u64 {
        ((self.reload as f64 * self.scaler) as u64).max(1)
    }

    fn read_startcc(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<u8> {
        self.count = 0xffff;
        if self.mode_is_timer() {
            self.timer_epoch = ctx.now();
            ctx.schedule_after(CT_TAG, self.timer_period())?;
        } else {
            self.counter_deadline = ctx.now() + self.counter_cycles();
            ctx.schedule_at(CT_TAG, self.counter_deadline)?;
        }
        Ok(0xff)
    }

    fn read_stopcc(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<u8> {
        self.counter_pending = false;
        self.update_ipl(ctx);
        if self.mode_is_timer() {
            // keep the square wave running on period boundaries
            let elapsed = ctx.now() - self.timer_epoch;
            let period = self.timer_period();
            let deadline = self.timer_epoch + (elapsed / period + 1) * period;
            ctx.schedule_at(CT_TAG, deadline)?;
        } else {
            ctx.cancel(CT_TAG);
            let now = ctx.now();
            self.count = if now < self.counter_deadline {
                ((self.counter_deadline - now) as f64 / self.scaler) as u16
            } else {
                let overrun = ((now - self.counter_deadline) as f64 / self.scaler) as u64;
                (0x10000u64.saturating_sub(overrun)) as u16
            };
        }
        Ok(0xff)
    }

    fn read_reg(&mut self, ctx: &mut DeviceCtx<'_>, index: u32) -> Result<u8> {
        Ok(match index {
            0 => self.a.read_mr(),
            1 => self.a.read_sr(),
            3 => {
                let v = self.a.read_rb();
                self.update_ipl(ctx);
                v
            }
            // CTSA/CTSB are always asserted
            4 | 13 => 0x03,
            5 => self.isr(),
            6 => (self.count >> 8) as u8,
            7 => (self.count & 0xff) as u8,
            8 => self.b.read_mr(),
            9 => self.b.read_sr(),
            11 => {
                let v = self.b.read_rb();
                self.update_ipl(ctx);
                v
            }
            12 => self.ivr,
            14 => self.read_startcc(ctx)?,
            15 => self.read_stopcc(ctx)?,
            // CSRA/CSRB and friends read as zero
            _ => 0,
        })
    }

    fn write_reg(&mut self, ctx: &mut DeviceCtx<'_>, index: u32, value: u8) -> Result<()> {
        match index {
            0 => self.a.write_mr(value),
            2 => {
                self.a.write_cr(value);
                self.update_ipl(ctx);
            }
            3 => self.write_tb(ctx, DuartPort::A, value)?,
            4 => self.write_acr(ctx, value),
            5 => {
                self.imr = value;
                self.update_ipl(ctx);
            }
            6 => self.reload = (self.reload & 0x00ff) | ((value as u16) << 8),
            7 => self.reload = (self.reload & 0xff00) | value as u16,
            8 => self.b.write_mr(value),
            10 => {
                self.b.write_cr(value);
                self.update_ipl(ctx);
            }
            11 => self.write_tb(ctx, DuartPort::B, value)?,
            12 => self.ivr = value,
            // CSRA/CSRB, OPCR/OPSET/OPCLR are accepted and ignored
            _ => {}
        }
        Ok(())
    }
}

impl Device for Mc68681 {
    fn name(&self) -> &str {
        "duart"
    }

    fn registers(&self) -> Option<&RegisterMap> {
        Some(&self.regs)
    }

    fn window(&self) -> u32 {
        match self.arrangement {
            RegisterArrangement::Packed8 => 16,
            _ => 32,
        }
    }

    fn reset(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<()> {
        self.a.reset();
        self.b.reset();
        self.imr = 0;
        self.ivr = 0x0f;
        self.counter_pending = false;
        self.reload = 1;
        self.write_acr(ctx, MODE_TMR_XTAL16);
        self.read_startcc(ctx)?;
        Ok(())
    }

    fn read(&mut self, ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>> {
        if width != Width::Byte {
            return Ok(None);
        }
        let Some(index) = self.arrangement.index_of(offset).filter(|&i| i < 16) else {
            return Ok(None);
        };
        self.read_reg(ctx, index).map(|v| Some(v as u32))
    }

    fn write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<bool> {
        if width != Width::Byte {
            return Ok(false);
        }
        let Some(index) = self.arrangement.index_of(offset).filter(|&i| i < 16) else {
            return Ok(false);
        };
        self.write_reg(ctx, index, value as u8)?;
        Ok(true)
    }

    fn vector(&mut self, _ctx: &mut DeviceCtx<'_>, _level: u8) -> Option<u8> {
        Some(self.ivr)
    }

    fn tick(&mut self, ctx: &mut DeviceCtx<'_>, tag: &str) -> Result<()> {
        match tag {
            CT_TAG => {
                self.counter_pending = true;
                self.update_ipl(ctx);
            }
            t if t == DuartPort::A.tx_tag() => self.tx_done(ctx, DuartPort::A)?,
            t if t == DuartPort::B.tx_tag() => self.tx_done(ctx, DuartPort::B)?,
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
