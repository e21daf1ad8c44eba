//! Memory-mapped CompactFlash (ATA/IDE) card.
//!
//! Reference: XT13/2008D. LBA28 only; READ SECTORS, WRITE SECTORS and
//! IDENTIFY DEVICE are implemented against a raw sector image opened
//! read/write. The device-1 select bit is honoured but only device 0 is
//! backed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::device::{Device, DeviceCtx, RegAccess, RegisterMap};
use crate::devices::RegisterArrangement;
use crate::mem::Width;
use crate::{CoreError, Result};

pub const SECTOR_SIZE: usize = 512;

pub const STATUS_ERR: u32 = 0x01;
pub const STATUS_DRQ: u32 = 0x08;
pub const STATUS_DF: u32 = 0x20;
pub const STATUS_DRDY: u32 = 0x40;
pub const STATUS_BSY: u32 = 0x80;

pub const ERROR_ABORT: u32 = 0x04;
pub const ERROR_ID_NOT_FOUND: u32 = 0x10;
pub const ERROR_UNCORRECTABLE: u32 = 0x40;

pub const DRH_DEV1: u32 = 0x10;
pub const DRH_LBA_EN: u32 = 0x40;
pub const DRH_HEAD_MASK: u32 = 0x0f;

pub const CMD_READ_SECTORS: u32 = 0x20;
pub const CMD_WRITE_SECTORS: u32 = 0x30;
pub const CMD_IDENTIFY_DEVICE: u32 = 0xec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegId {
    Data16,
    Data8,
    ErrorFeature,
    SectorCount,
    SectorNumber,
    CylinderLow,
    CylinderHigh,
    DriveHead,
    StatusCommand,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum XferMode {
    None,
    Read,
    Write,
    Identify,
}

pub struct CompactFlash {
    regs: RegisterMap,
    arrangement: RegisterArrangement,
    file: Option<File>,
    file_size: u64,
    identify: [u8; SECTOR_SIZE],
    r_error: u32,
    r_feature: u32,
    r_sector_count: u32,
    r_sector_number: u32,
    r_cylinder: u32,
    r_drive_head: u32,
    r_status: u32,
    mode: XferMode,
    bytes_remaining: usize,
}

impl CompactFlash {
    pub fn new(path: Option<&Path>, arrangement: RegisterArrangement) -> Result<Self> {
        if arrangement == RegisterArrangement::Doubled16 {
            return Err(CoreError::Config(
                "CompactFlash supports 8-bit and 16-bit register arrangements".into(),
            ));
        }
        let mut file = None;
        let mut file_size = 0;
        if let Some(path) = path {
            let f = OpenOptions::new().read(true).write(true).open(path)?;
            file_size = f.metadata()?.len();
            if file_size % SECTOR_SIZE as u64 != 0 {
                return Err(CoreError::Config(format!(
                    "disk file {} size {} is not a multiple of the sector size",
                    path.display(),
                    file_size
                )));
            }
            file = Some(f);
        }
        let sectors = (file_size / SECTOR_SIZE as u64) as u32;
        let regs = match arrangement {
            RegisterArrangement::Wide16 => RegisterMap::new(&[
                ("DATA16", 0x00, Width::Word, RegAccess::RW),
                ("DATA8", 0x01, Width::Byte, RegAccess::RW),
                ("ERROR/FEATURE", 0x03, Width::Byte, RegAccess::RW),
                ("SECTOR_COUNT", 0x05, Width::Byte, RegAccess::RW),
                ("SECTOR_NUMBER", 0x07, Width::Byte, RegAccess::RW),
                ("CYLINDER_LOW", 0x09, Width::Byte, RegAccess::RW),
                ("CYLINDER_HIGH", 0x0b, Width::Byte, RegAccess::RW),
                ("DRIVE/HEAD", 0x0d, Width::Byte, RegAccess::RW),
                ("STATUS/COMMAND", 0x0f, Width::Byte, RegAccess::RW),
            ]),
            _ => RegisterMap::new(&[
                ("DATA8", 0x00, Width::Byte, RegAccess::RW),
                ("ERROR/FEATURE", 0x01, Width::Byte, RegAccess::RW),
                ("SECTOR_COUNT", 0x02, Width::Byte, RegAccess::RW),
                ("SECTOR_NUMBER", 0x03, Width::Byte, RegAccess::RW),
                ("CYLINDER_LOW", 0x04, Width::Byte, RegAccess::RW),
                ("CYLINDER_HIGH", 0x05, Width::Byte, RegAccess::RW),
                ("DRIVE/HEAD", 0x06, Width::Byte, RegAccess::RW),
                ("STATUS/COMMAND", 0x07, Width::Byte, RegAccess::RW),
            ]),
        };
        Ok(Self {
            regs,
            arrangement,
            r_status: if file.is_some() { STATUS_DRDY } else { STATUS_DF },
            file,
            file_size,
            identify: build_identify(sectors),
            r_error: 0,
            r_feature: 0,
            r_sector_count: 0,
            r_sector_number: 0,
            r_cylinder: 0,
            r_drive_head: 0,
            mode: XferMode::None,
            bytes_remaining: 0,
        })
    }

    fn decode(&self, offset: u32, width: Width) -> Option<RegId> {
        match (self.arrangement, offset, width) {
            (RegisterArrangement::Wide16, 0x00, Width::Word) => Some(RegId::Data16),
            (RegisterArrangement::Wide16, 0x01, Width::Byte) => Some(RegId::Data8),
            (RegisterArrangement::Wide16, 0x03, Width::Byte) => Some(RegId::ErrorFeature),
            (RegisterArrangement::Wide16, 0x05, Width::Byte) => Some(RegId::SectorCount),
            (RegisterArrangement::Wide16, 0x07, Width::Byte) => Some(RegId::SectorNumber),
            (RegisterArrangement::Wide16, 0x09, Width::Byte) => Some(RegId::CylinderLow),
            (RegisterArrangement::Wide16, 0x0b, Width::Byte) => Some(RegId::CylinderHigh),
            (RegisterArrangement::Wide16, 0x0d, Width::Byte) => Some(RegId::DriveHead),
            (RegisterArrangement::Wide16, 0x0f, Width::Byte) => Some(RegId::StatusCommand),
            (RegisterArrangement::Packed8, 0x00, Width::Byte) => Some(RegId::Data8),
            (RegisterArrangement::Packed8, 0x01, Width::Byte) => Some(RegId::ErrorFeature),
            (RegisterArrangement::Packed8, 0x02, Width::Byte) => Some(RegId::SectorCount),
            (RegisterArrangement::Packed8, 0x03, Width::Byte) => Some(RegId::SectorNumber),
            (RegisterArrangement::Packed8, 0x04, Width::Byte) => Some(RegId::CylinderLow),
            (RegisterArrangement::Packed8, 0x05, Width::Byte) => Some(RegId::CylinderHigh),
            (RegisterArrangement::Packed8, 0x06, Width::Byte) => Some(RegId::DriveHead),
            (RegisterArrangement::Packed8, 0x07, Width::Byte) => Some(RegId::StatusCommand),
            _ => None,
        }
    }

    fn device1_selected(&self) -> bool {
        self.r_drive_head & DRH_DEV1 != 0
    }

    fn lba(&self) -> Option<u64> {
        if self.r_drive_head & DRH_LBA_EN == 0 {
            return None;
        }
        Some(
            self.r_sector_number as u64
                | (self.r_cylinder as u64) << 8
                | ((self.r_drive_head & DRH_HEAD_MASK) as u64) << 24,
        )
    }

    fn abort(&mut self) {
        self.r_status = STATUS_DRDY | STATUS_ERR;
        self.r_error = ERROR_ABORT;
        self.mode = XferMode::None;
        self.bytes_remaining = 0;
    }

    fn command(&mut self, cmd: u32) -> Result<()> {
        if self.device1_selected() {
            log::debug!(target: "cf", "command {cmd:#04x} for unbacked device 1");
            self.abort();
            return Ok(());
        }
        match cmd {
            CMD_READ_SECTORS => self.start_io(XferMode::Read),
            CMD_WRITE_SECTORS => self.start_io(XferMode::Write),
            CMD_IDENTIFY_DEVICE => {
                self.r_status = STATUS_DRDY | STATUS_DRQ;
                self.r_error = 0;
                self.bytes_remaining = SECTOR_SIZE;
                self.mode = XferMode::Identify;
                Ok(())
            }
            _ => {
                log::debug!(target: "cf", "command {cmd:#04x} not supported");
                self.abort();
                Ok(())
            }
        }
    }

    fn start_io(&mut self, mode: XferMode) -> Result<()> {
        if self.r_status & STATUS_DF != 0 {
            self.r_status |= STATUS_ERR;
            self.r_error = ERROR_UNCORRECTABLE;
            return Ok(());
        }
        self.r_status &= !(STATUS_ERR | STATUS_DRQ);
        self.r_error = 0;
        self.mode = XferMode::None;

        let Some(lba) = self.lba() else {
            log::debug!(target: "cf", "CHS addressing not supported");
            self.abort();
            return Ok(());
        };
        // a zero sector count transfers 256 sectors
        let sectors = if self.r_sector_count == 0 {
            256
        } else {
            self.r_sector_count as usize
        };
        let bytes = sectors * SECTOR_SIZE;
        let offset = lba * SECTOR_SIZE as u64;
        if offset + bytes as u64 > self.file_size {
            log::debug!(target: "cf", "access beyond end of device");
            self.r_status |= STATUS_ERR;
            self.r_error = ERROR_ID_NOT_FOUND;
            return Ok(());
        }
        self.file
            .as_mut()
            .expect("DF clear implies a backing file")
            .seek(SeekFrom::Start(offset))?;
        self.bytes_remaining = bytes;
        self.r_status |= STATUS_DRQ;
        self.mode = mode;
        Ok(())
    }

    fn end_transfer_if_done(&mut self) {
        if self.bytes_remaining == 0 {
            self.r_status &= !STATUS_DRQ;
            self.mode = XferMode::None;
        }
    }

    fn io_read(&mut self, width: Width) -> Result<u32> {
        if self.device1_selected() {
            return Ok(0);
        }
        let count = if width == Width::Byte { 1 } else { 2 };
        match self.mode {
            XferMode::Identify => {
                if self.bytes_remaining < count {
                    log::debug!(target: "cf", "read beyond identify buffer");
                    return Ok(0);
                }
                let index = SECTOR_SIZE - self.bytes_remaining;
                self.bytes_remaining -= count;
                let value = if count == 1 {
                    self.identify[index] as u32
                } else {
                    // words are stored high byte first
                    (self.identify[index] as u32) << 8 | self.identify[index + 1] as u32
                };
                self.end_transfer_if_done();
                Ok(value)
            }
            XferMode::Read => {
                if self.bytes_remaining < count {
                    log::debug!(target: "cf", "read beyond sector buffer");
                    return Ok(0);
                }
                let mut data = [0u8; 2];
                let file = self.file.as_mut().expect("read mode implies a file");
                file.read_exact(&mut data[..count])?;
                self.bytes_remaining -= count;
                let value = if count == 1 {
                    data[0] as u32
                } else {
                    // the 16-bit data port moves the even byte on the low half
                    (data[1] as u32) << 8 | data[0] as u32
                };
                self.end_transfer_if_done();
                Ok(value)
            }
            _ => {
                log::debug!(target: "cf", "data read outside a transfer");
                Ok(0)
            }
        }
    }

    fn io_write(&mut self, width: Width, value: u32) -> Result<()> {
        if self.device1_selected() {
            return Ok(());
        }
        if self.mode != XferMode::Write {
            log::debug!(target: "cf", "data write outside a write transfer");
            return Ok(());
        }
        let mut data = [0u8; 2];
        data[0] = value as u8;
        let count = if width == Width::Byte {
            1
        } else {
            data[1] = (value >> 8) as u8;
            2
        };
        if self.bytes_remaining < count {
            log::debug!(target: "cf", "write beyond sector buffer");
            return Ok(());
        }
        let file = self.file.as_mut().expect("write mode implies a file");
        file.write_all(&data[..count])?;
        self.bytes_remaining -= count;
        if self.bytes_remaining == 0 {
            file.flush()?;
        }
        self.end_transfer_if_done();
        Ok(())
    }
}

impl Device for CompactFlash {
    fn name(&self) -> &str {
        "cf"
    }

    fn registers(&self) -> Option<&RegisterMap> {
        Some(&self.regs)
    }

    fn reset(&mut self, _ctx: &mut DeviceCtx<'_>) -> Result<()> {
        self.r_error = 0;
        self.r_feature = 0;
        self.r_sector_count = 0;
        self.r_sector_number = 0;
        self.r_cylinder = 0;
        self.r_drive_head = 0;
        self.r_status = if self.file.is_some() {
            STATUS_DRDY
        } else {
            STATUS_DF
        };
        self.mode = XferMode::None;
        self.bytes_remaining = 0;
        Ok(())
    }

    fn read(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u32, width: Width) -> Result<Option<u32>> {
        let Some(reg) = self.decode(offset, width) else {
            return Ok(None);
        };
        let value = match reg {
            RegId::Data16 | RegId::Data8 => self.io_read(width)?,
            RegId::ErrorFeature => self.r_error,
            RegId::SectorCount => self.r_sector_count,
            RegId::SectorNumber => self.r_sector_number,
            RegId::CylinderLow => self.r_cylinder & 0xff,
            RegId::CylinderHigh => self.r_cylinder >> 8,
            RegId::DriveHead => self.r_drive_head,
            RegId::StatusCommand => {
                if self.device1_selected() {
                    0
                } else {
                    self.r_status
                }
            }
        };
        Ok(Some(value))
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<bool> {
        let Some(reg) = self.decode(offset, width) else {
            return Ok(false);
        };
        match reg {
            RegId::Data16 | RegId::Data8 => self.io_write(width, value)?,
            RegId::ErrorFeature => self.r_feature = value,
            RegId::SectorCount => self.r_sector_count = value & 0xff,
            RegId::SectorNumber => self.r_sector_number = value & 0xff,
            RegId::CylinderLow => self.r_cylinder = (self.r_cylinder & 0xff00) | (value & 0xff),
            RegId::CylinderHigh => {
                self.r_cylinder = (self.r_cylinder & 0x00ff) | ((value & 0xff) << 8)
            }
            RegId::DriveHead => self.r_drive_head = value & 0xff,
            RegId::StatusCommand => self.command(value & 0xff)?,
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

fn put_word(buf: &mut [u8; SECTOR_SIZE], word: usize, value: u16) {
    buf[word * 2] = (value >> 8) as u8;
    buf[word * 2 + 1] = value as u8;
}

fn put_str(buf: &mut [u8; SECTOR_SIZE], word: usize, len_words: usize, s: &str) {
    let start = word * 2;
    let area = &mut buf[start..start + len_words * 2];
    for (dst, src) in area.iter_mut().zip(s.bytes().chain(std::iter::repeat(b' '))) {
        *dst = src;
    }
}

/// IDENTIFY DEVICE block: geometry, id strings, LBA capacity.
fn build_identify(sectors: u32) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    put_word(&mut buf, 1, 16383); // cylinders
    put_word(&mut buf, 3, 16); // heads
    put_word(&mut buf, 6, 63); // sectors per track
    put_str(&mut buf, 10, 10, "00000000"); // serial number
    put_str(&mut buf, 23, 4, "00000000"); // firmware version
    put_str(&mut buf, 27, 20, "m68k emulated CF"); // model number
    put_word(&mut buf, 47, 1); // sectors per READ/WRITE MULTIPLE
    put_word(&mut buf, 60, sectors as u16); // LBA capacity, low
    put_word(&mut buf, 61, (sectors >> 16) as u16); // LBA capacity, high
    buf
}
