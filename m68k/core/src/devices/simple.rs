//! The "simple" machine peripherals: a UART, a countdown timer and a
//! sector-addressed disk. Small register blocks with just enough behaviour
//! to boot test firmware and exercise the device framework.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::device::{Device, DeviceCtx, RegAccess, RegisterMap};
use crate::mem::Width;
use crate::{CoreError, Result};

// ---- UART ----

pub const UART_SR_RXRDY: u32 = 0x01;
pub const UART_SR_TXRDY: u32 = 0x02;
pub const UART_CR_RX_INTEN: u32 = 0x01;
pub const UART_CR_TX_INTEN: u32 = 0x02;

const UART_REG_SR: u32 = 0x01;
const UART_REG_DR: u32 = 0x03;
const UART_REG_CR: u32 = 0x05;
const UART_REG_VR: u32 = 0x07;

/// Byte-wide console UART. Transmit completes immediately; received bytes
/// queue until the guest drains them. Interrupts are enabled per direction
/// through CR and delivered at the vector programmed into VR.
pub struct SimpleUart {
    regs: RegisterMap,
    rxfifo: VecDeque<u8>,
    txout: VecDeque<u8>,
    cr: u32,
    vr: u32,
}

impl Default for SimpleUart {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleUart {
    pub fn new() -> Self {
        Self {
            regs: RegisterMap::new(&[
                ("SR", UART_REG_SR, Width::Byte, RegAccess::R),
                ("DR", UART_REG_DR, Width::Byte, RegAccess::RW),
                ("CR", UART_REG_CR, Width::Byte, RegAccess::RW),
                ("VR", UART_REG_VR, Width::Byte, RegAccess::RW),
            ]),
            rxfifo: VecDeque::new(),
            txout: VecDeque::new(),
            cr: 0,
            vr: 0,
        }
    }

    /// Feed console input, as the host console does between quanta.
    pub fn push_input(&mut self, ctx: &mut DeviceCtx<'_>, bytes: &[u8]) {
        self.rxfifo.extend(bytes);
        self.update_ipl(ctx);
    }

    /// Drain transmitted bytes for the host console.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.txout.drain(..).collect()
    }

    fn status(&self) -> u32 {
        let mut sr = UART_SR_TXRDY;
        if !self.rxfifo.is_empty() {
            sr |= UART_SR_RXRDY;
        }
        sr
    }

    fn update_ipl(&mut self, ctx: &mut DeviceCtx<'_>) {
        if self.cr & UART_CR_TX_INTEN != 0 {
            ctx.assert_ipl();
        } else if self.cr & UART_CR_RX_INTEN != 0 && !self.rxfifo.is_empty() {
            ctx.assert_ipl();
        } else {
            ctx.deassert_ipl();
        }
    }
}

impl Device for SimpleUart {
    fn name(&self) -> &str {
        "uart"
    }

    fn registers(&self) -> Option<&RegisterMap> {
        Some(&self.regs)
    }

    fn window(&self) -> u32 {
        0x08
    }

    fn reset(&mut self, _ctx: &mut DeviceCtx<'_>) -> Result<()> {
        self.rxfifo.clear();
        self.txout.clear();
        self.cr = 0;
        self.vr = 0;
        Ok(())
    }

    fn read(&mut self, ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>> {
        if width != Width::Byte {
            return Ok(None);
        }
        Ok(match offset {
            UART_REG_SR => Some(self.status()),
            UART_REG_DR => {
                let value = self.rxfifo.pop_front().unwrap_or(0) as u32;
                self.update_ipl(ctx);
                Some(value)
            }
            UART_REG_CR => Some(self.cr),
            UART_REG_VR => Some(self.vr),
            _ => None,
        })
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
        match offset {
            UART_REG_DR => self.txout.push_back(value as u8),
            UART_REG_CR => {
                self.cr = value;
                self.update_ipl(ctx);
            }
            UART_REG_VR => self.vr = value,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn vector(&mut self, _ctx: &mut DeviceCtx<'_>, _level: u8) -> Option<u8> {
        (self.vr > 0).then_some(self.vr as u8)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// ---- timer ----

const TIMER_REG_COUNT: u32 = 0x00;
const TIMER_REG_VECTOR: u32 = 0x05;
const TIMER_TAG: &str = "count";

/// Microsecond timebase with a countdown interrupt.
///
/// Reading COUNT returns elapsed microseconds since reset. Writing COUNT
/// arms a countdown of that many microseconds which raises the configured
/// interrupt level on expiry and reloads itself; writing zero disarms it.
pub struct SimpleTimer {
    regs: RegisterMap,
    reload_micros: u32,
    vector: u32,
}

impl Default for SimpleTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleTimer {
    pub fn new() -> Self {
        Self {
            regs: RegisterMap::new(&[
                ("COUNT", TIMER_REG_COUNT, Width::Long, RegAccess::RW),
                ("VECTOR", TIMER_REG_VECTOR, Width::Byte, RegAccess::RW),
            ]),
            reload_micros: 0,
            vector: 0,
        }
    }

    fn arm(&self, ctx: &mut DeviceCtx<'_>) -> Result<()> {
        let cycles = self.reload_micros as u64 * ctx.cycles_per_micro();
        ctx.schedule_after(TIMER_TAG, cycles.max(1))
    }
}

impl Device for SimpleTimer {
    fn name(&self) -> &str {
        "timer"
    }

    fn registers(&self) -> Option<&RegisterMap> {
        Some(&self.regs)
    }

    fn window(&self) -> u32 {
        0x06
    }

    fn reset(&mut self, _ctx: &mut DeviceCtx<'_>) -> Result<()> {
        self.reload_micros = 0;
        self.vector = 0;
        Ok(())
    }

    fn read(&mut self, ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>> {
        Ok(match (offset, width) {
            (TIMER_REG_COUNT, Width::Long) => Some(ctx.now_micros() as u32),
            (TIMER_REG_VECTOR, Width::Byte) => Some(self.vector),
            _ => None,
        })
    }

    fn write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<bool> {
        match (offset, width) {
            (TIMER_REG_COUNT, Width::Long) => {
                if value == 0 {
                    ctx.deassert_ipl();
                    ctx.cancel(TIMER_TAG);
                    self.reload_micros = 0;
                    log::debug!(target: "timer", "countdown cancelled");
                } else {
                    self.reload_micros = value;
                    self.arm(ctx)?;
                    log::debug!(target: "timer", "countdown armed for {value}us");
                }
                Ok(true)
            }
            (TIMER_REG_VECTOR, Width::Byte) => {
                self.vector = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn vector(&mut self, ctx: &mut DeviceCtx<'_>, _level: u8) -> Option<u8> {
        ctx.deassert_ipl();
        (self.vector > 0).then_some(self.vector as u8)
    }

    fn tick(&mut self, ctx: &mut DeviceCtx<'_>, tag: &str) -> Result<()> {
        if tag == TIMER_TAG && self.reload_micros > 0 {
            ctx.assert_ipl();
            self.arm(ctx)?;
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

// ---- disk ----

pub const DISK_SECTOR_SIZE: usize = 512;

pub const DISK_STATUS_IDLE: u32 = 0;
pub const DISK_STATUS_NOT_READY: u32 = 1;
pub const DISK_STATUS_ERROR: u32 = 2;
pub const DISK_STATUS_DATA_READY: u32 = 3;

pub const DISK_CMD_READ: u32 = 1;
pub const DISK_CMD_WRITE: u32 = 2;

const DISK_REG_SECTOR: u32 = 0x00;
const DISK_REG_COUNT: u32 = 0x04;
const DISK_REG_STATUS: u32 = 0x08;
const DISK_REG_DATA: u32 = 0x0c;

#[derive(Clone, Copy, PartialEq, Eq)]
enum XferMode {
    None,
    Read,
    Write,
}

/// Sector-addressed disk over a raw backing file.
///
/// The guest programs SECTOR and COUNT, writes READ or WRITE to CMD, then
/// pumps the 32-bit DATA window; STATUS answers DATA_READY during the
/// transfer and IDLE once the last word has moved. COUNT reads back as the
/// medium size in sectors.
pub struct SimpleDisk {
    regs: RegisterMap,
    file: Option<File>,
    total_sectors: u32,
    sector: u32,
    count: u32,
    status: u32,
    mode: XferMode,
    buffer: Vec<u8>,
    pos: usize,
}

impl SimpleDisk {
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let mut file = None;
        let mut total_sectors = 0;
        if let Some(path) = path {
            let f = OpenOptions::new().read(true).write(true).open(path)?;
            let len = f.metadata()?.len();
            if len % DISK_SECTOR_SIZE as u64 != 0 {
                return Err(CoreError::Config(format!(
                    "disk file {} size {} is not a multiple of the sector size",
                    path.display(),
                    len
                )));
            }
            total_sectors = (len / DISK_SECTOR_SIZE as u64) as u32;
            file = Some(f);
        }
        Ok(Self {
            regs: RegisterMap::new(&[
                ("SECTOR", DISK_REG_SECTOR, Width::Long, RegAccess::RW),
                ("COUNT", DISK_REG_COUNT, Width::Long, RegAccess::RW),
                ("STATUS", DISK_REG_STATUS, Width::Long, RegAccess::RW),
                ("DATA", DISK_REG_DATA, Width::Long, RegAccess::RW),
            ]),
            status: if file.is_some() {
                DISK_STATUS_IDLE
            } else {
                DISK_STATUS_NOT_READY
            },
            file,
            total_sectors,
            sector: 0,
            count: 0,
            mode: XferMode::None,
            buffer: Vec::new(),
            pos: 0,
        })
    }

    fn ready(&self) -> bool {
        self.file.is_some()
    }

    fn command(&mut self, cmd: u32) -> Result<()> {
        self.mode = XferMode::None;
        self.buffer.clear();
        self.pos = 0;
        if !self.ready() {
            self.status = DISK_STATUS_NOT_READY;
            return Ok(());
        }
        let end = self.sector as u64 + self.count as u64;
        if self.count == 0 || end > self.total_sectors as u64 {
            log::debug!(
                target: "disk",
                "rejecting transfer: sector {} count {} of {}",
                self.sector,
                self.count,
                self.total_sectors
            );
            self.status = DISK_STATUS_ERROR;
            return Ok(());
        }
        let bytes = self.count as usize * DISK_SECTOR_SIZE;
        let offset = self.sector as u64 * DISK_SECTOR_SIZE as u64;
        let file = self.file.as_mut().expect("backing file");
        match cmd {
            DISK_CMD_READ => {
                self.buffer.resize(bytes, 0);
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut self.buffer)?;
                self.mode = XferMode::Read;
                self.status = DISK_STATUS_DATA_READY;
            }
            DISK_CMD_WRITE => {
                self.buffer.resize(bytes, 0);
                self.mode = XferMode::Write;
                self.status = DISK_STATUS_DATA_READY;
            }
            _ => {
                log::debug!(target: "disk", "unknown command {cmd:#x}");
                self.status = DISK_STATUS_ERROR;
            }
        }
        Ok(())
    }

    fn data_read(&mut self) -> u32 {
        if self.mode != XferMode::Read || self.pos + 4 > self.buffer.len() {
            log::debug!(target: "disk", "data read outside a read transfer");
            return 0;
        }
        let w = &self.buffer[self.pos..self.pos + 4];
        let value = u32::from_be_bytes([w[0], w[1], w[2], w[3]]);
        self.pos += 4;
        if self.pos == self.buffer.len() {
            self.mode = XferMode::None;
            self.status = DISK_STATUS_IDLE;
        }
        value
    }

    fn data_write(&mut self, value: u32) -> Result<()> {
        if self.mode != XferMode::Write || self.pos + 4 > self.buffer.len() {
            log::debug!(target: "disk", "data write outside a write transfer");
            return Ok(());
        }
        self.buffer[self.pos..self.pos + 4].copy_from_slice(&value.to_be_bytes());
        self.pos += 4;
        if self.pos == self.buffer.len() {
            let offset = self.sector as u64 * DISK_SECTOR_SIZE as u64;
            let file = self.file.as_mut().expect("backing file");
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&self.buffer)?;
            file.flush()?;
            self.mode = XferMode::None;
            self.status = DISK_STATUS_IDLE;
        }
        Ok(())
    }
}

impl Device for SimpleDisk {
    fn name(&self) -> &str {
        "disk"
    }

    fn registers(&self) -> Option<&RegisterMap> {
        Some(&self.regs)
    }

    fn window(&self) -> u32 {
        0x10
    }

    fn reset(&mut self, _ctx: &mut DeviceCtx<'_>) -> Result<()> {
        self.sector = 0;
        self.count = 0;
        self.mode = XferMode::None;
        self.buffer.clear();
        self.pos = 0;
        self.status = if self.ready() {
            DISK_STATUS_IDLE
        } else {
            DISK_STATUS_NOT_READY
        };
        Ok(())
    }

    fn read(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>> {
        if width != Width::Long {
            return Ok(None);
        }
        Ok(match offset {
            DISK_REG_SECTOR => Some(self.sector),
            // reads report the medium size; the transfer count is write-only
            DISK_REG_COUNT => Some(self.total_sectors),
            DISK_REG_STATUS => Some(self.status),
            DISK_REG_DATA => Some(self.data_read()),
            _ => None,
        })
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<bool> {
        if width != Width::Long {
            return Ok(false);
        }
        match offset {
            DISK_REG_SECTOR => self.sector = value,
            DISK_REG_COUNT => self.count = value,
            DISK_REG_STATUS => self.command(value)?,
            DISK_REG_DATA => self.data_write(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
