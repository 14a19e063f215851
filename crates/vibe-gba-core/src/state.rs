//! Save states.
//!
//! Layout: the magic `VGBA`, a little-endian `u16` format version, then a
//! sequence of sections `(tag: [u8; 4], len: u32, payload)`. Inside a
//! section every integer is little-endian and every memory block carries a
//! `u32` length prefix so a blob taken against a different memory layout is
//! rejected instead of misread. Cartridge ROM is never stored.
//!
//! Restoring decodes the whole blob into fresh component values and only
//! then swaps them into the machine, so a failed restore changes nothing.

use thiserror::Error;

use crate::backup::{Backup, EEPROM_READ_BITS, EepromState, FlashMode};
use crate::bus::Access;
use crate::cpu::registers::Mode;
use crate::cpu::{Cpu, CpuError};
use crate::dma::Dma;
use crate::gba::Machine;
use crate::interrupt::InterruptState;
use crate::input::Keypad;
use crate::ppu::{LINE_CYCLES, LINES_PER_FRAME, Ppu};
use crate::timer::Timers;
use crate::video::Video;

const MAGIC: &[u8; 4] = b"VGBA";
/// Current save-state format version.
pub const STATE_VERSION: u16 = 1;

const TAG_CPU: &[u8; 4] = b"CPU ";
const TAG_BUS: &[u8; 4] = b"BUS ";
const TAG_VIDEO: &[u8; 4] = b"VIDE";
const TAG_PPU: &[u8; 4] = b"PPU ";
const TAG_IRQ: &[u8; 4] = b"IRQ ";
const TAG_TIMERS: &[u8; 4] = b"TIMR";
const TAG_DMA: &[u8; 4] = b"DMA ";
const TAG_KEYS: &[u8; 4] = b"KEYS";
const TAG_BACKUP: &[u8; 4] = b"BKUP";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("not a save state")]
    BadMagic,

    #[error("save state is truncated")]
    Truncated,

    #[error("save state version {found} is not supported (this build reads version {supported})")]
    VersionMismatch { found: u16, supported: u16 },

    #[error("{region} is {found} bytes in the save state but {expected} bytes here")]
    SizeMismatch {
        region: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("save state has no {0} section")]
    MissingSection(String),

    #[error("save state holds {found} backup memory but the cartridge uses {expected}")]
    BackupMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("no cartridge loaded")]
    NoCartridge,

    #[error("save state holds an out-of-range {0}")]
    Corrupt(&'static str),
}

type Result<T> = std::result::Result<T, StateError>;

fn ensure(ok: bool, what: &'static str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(StateError::Corrupt(what))
    }
}

#[derive(Default)]
struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    fn u16s(&mut self, v: &[u16]) {
        self.u32(v.len() as u32);
        v.iter().for_each(|&x| self.u16(x));
    }

    fn u32s(&mut self, v: &[u32]) {
        self.u32(v.len() as u32);
        v.iter().for_each(|&x| self.u32(x));
    }

    fn section(&mut self, tag: &[u8; 4], body: impl FnOnce(&mut StateWriter)) {
        let mut inner = StateWriter::default();
        body(&mut inner);
        self.buf.extend_from_slice(tag);
        self.u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
    }
}

struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(StateError::Truncated)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn block_len(&mut self, region: &'static str, expected: usize) -> Result<usize> {
        let found = self.u32()? as usize;
        if found != expected {
            return Err(StateError::SizeMismatch {
                region,
                expected,
                found,
            });
        }
        Ok(found)
    }

    /// Fill `dst` from a length-prefixed block of exactly `dst.len()` bytes.
    fn bytes_into(&mut self, region: &'static str, dst: &mut [u8]) -> Result<()> {
        let len = self.block_len(region, dst.len())?;
        dst.copy_from_slice(self.take(len)?);
        Ok(())
    }

    fn u16s_into(&mut self, region: &'static str, dst: &mut [u16]) -> Result<()> {
        self.block_len(region, dst.len())?;
        for v in dst.iter_mut() {
            *v = self.u16()?;
        }
        Ok(())
    }

    fn u32s_into(&mut self, region: &'static str, dst: &mut [u32]) -> Result<()> {
        self.block_len(region, dst.len())?;
        for v in dst.iter_mut() {
            *v = self.u32()?;
        }
        Ok(())
    }
}

/// Section payloads by tag, in blob order.
struct Sections<'a> {
    entries: Vec<([u8; 4], &'a [u8])>,
}

impl<'a> Sections<'a> {
    fn parse(blob: &'a [u8]) -> Result<Self> {
        let mut r = StateReader::new(blob);
        if r.take(MAGIC.len()).map_err(|_| StateError::BadMagic)? != MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = r.u16()?;
        if version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                found: version,
                supported: STATE_VERSION,
            });
        }
        let mut entries = Vec::new();
        while r.pos < blob.len() {
            let tag = r.array::<4>()?;
            let len = r.u32()? as usize;
            entries.push((tag, r.take(len)?));
        }
        Ok(Self { entries })
    }

    fn get(&self, tag: &[u8; 4]) -> Result<StateReader<'a>> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, payload)| StateReader::new(payload))
            .ok_or_else(|| {
                StateError::MissingSection(String::from_utf8_lossy(tag).trim_end().to_string())
            })
    }
}

/// Capture the machine. Fails only when no cartridge is loaded.
pub fn capture(machine: &Machine) -> Result<Vec<u8>> {
    let cart = machine.bus.cart.as_ref().ok_or(StateError::NoCartridge)?;
    let bus = &machine.bus;

    let mut w = StateWriter::default();
    w.buf.extend_from_slice(MAGIC);
    w.u16(STATE_VERSION);

    w.section(TAG_CPU, |w| write_cpu(w, &machine.cpu));
    w.section(TAG_BUS, |w| {
        w.bytes(&bus.ewram);
        w.bytes(&bus.iwram);
        w.u16s(&bus.io_latch);
        w.u16(bus.waitcnt);
        w.u8(bus.postflg);
        w.bool(bus.halt_requested);
        w.u64(bus.cycles);
        w.u32(bus.dma_latch);
    });
    w.section(TAG_VIDEO, |w| write_video(w, &bus.video));
    w.section(TAG_PPU, |w| {
        let ppu = &machine.ppu;
        w.u16(ppu.line);
        w.u32(ppu.line_cycle);
        w.bool(ppu.render_pending);
        w.bool(ppu.frame_ready);
        w.u64(ppu.frame_counter);
        w.u32s(&ppu.front);
        w.u32s(&ppu.back);
    });
    w.section(TAG_IRQ, |w| {
        w.u16(bus.irq.enable);
        w.u16(bus.irq.flags);
        w.bool(bus.irq.master_enable);
    });
    w.section(TAG_TIMERS, |w| {
        for t in &bus.timers.units {
            w.u16(t.reload);
            w.u16(t.counter);
            w.u16(t.control);
            w.u32(t.prescaler_acc);
        }
    });
    w.section(TAG_DMA, |w| {
        for ch in &bus.dma.channels {
            w.u32(ch.src);
            w.u32(ch.dst);
            w.u16(ch.count);
            w.u16(ch.control);
            w.u32(ch.internal_src);
            w.u32(ch.internal_dst);
            w.u32(ch.internal_count);
        }
    });
    w.section(TAG_KEYS, |w| {
        w.u16(bus.keypad.pressed_mask());
        w.u16(bus.keypad.keycnt);
    });
    w.section(TAG_BACKUP, |w| write_backup(w, &cart.backup));

    Ok(w.buf)
}

/// Restore a captured blob. Nothing is modified unless the whole blob
/// decodes against the current cartridge.
pub fn restore(machine: &mut Machine, blob: &[u8]) -> Result<()> {
    let sections = Sections::parse(blob)?;
    let cart = machine.bus.cart.as_ref().ok_or(StateError::NoCartridge)?;

    let mut cpu = machine.cpu.clone();
    read_cpu(&mut sections.get(TAG_CPU)?, &mut cpu)?;

    let bus = &machine.bus;
    let mut ewram = bus.ewram.clone();
    let mut iwram = bus.iwram.clone();
    let mut io_latch = bus.io_latch.clone();
    let mut r = sections.get(TAG_BUS)?;
    r.bytes_into("EWRAM", &mut ewram)?;
    r.bytes_into("IWRAM", &mut iwram)?;
    r.u16s_into("I/O registers", &mut io_latch)?;
    let waitcnt = r.u16()?;
    let postflg = r.u8()?;
    let halt_requested = r.bool()?;
    let cycles = r.u64()?;
    let dma_latch = r.u32()?;

    let mut video = Video::new();
    read_video(&mut sections.get(TAG_VIDEO)?, &mut video)?;

    let mut ppu = Ppu::new();
    let mut r = sections.get(TAG_PPU)?;
    ppu.line = r.u16()?;
    ppu.line_cycle = r.u32()?;
    ensure(ppu.line < LINES_PER_FRAME, "scanline")?;
    ensure(ppu.line_cycle < LINE_CYCLES, "scanline cycle")?;
    ppu.render_pending = r.bool()?;
    ppu.frame_ready = r.bool()?;
    ppu.frame_counter = r.u64()?;
    r.u32s_into("front buffer", &mut ppu.front)?;
    r.u32s_into("back buffer", &mut ppu.back)?;

    let mut r = sections.get(TAG_IRQ)?;
    let irq = InterruptState {
        enable: r.u16()?,
        flags: r.u16()?,
        master_enable: r.bool()?,
    };

    let mut timers = Timers::new();
    let mut r = sections.get(TAG_TIMERS)?;
    for t in &mut timers.units {
        t.reload = r.u16()?;
        t.counter = r.u16()?;
        t.control = r.u16()?;
        t.prescaler_acc = r.u32()?;
        ensure(t.prescaler_acc < 1024, "timer prescaler count")?;
    }

    let mut dma = Dma::new();
    let mut r = sections.get(TAG_DMA)?;
    for ch in &mut dma.channels {
        ch.src = r.u32()?;
        ch.dst = r.u32()?;
        ch.count = r.u16()?;
        ch.control = r.u16()?;
        ch.internal_src = r.u32()?;
        ch.internal_dst = r.u32()?;
        ch.internal_count = r.u32()?;
        ensure(ch.internal_count <= 0x1_0000, "DMA word count")?;
    }

    let mut keypad = Keypad::new();
    let mut r = sections.get(TAG_KEYS)?;
    keypad.restore_pressed(r.u16()?);
    keypad.keycnt = r.u16()?;

    let mut backup = cart.backup.clone();
    read_backup(&mut sections.get(TAG_BACKUP)?, &mut backup)?;

    // Everything decoded; commit.
    machine.cpu = cpu;
    let bus = &mut machine.bus;
    bus.ewram = ewram;
    bus.iwram = iwram;
    bus.io_latch = io_latch;
    bus.write_io16(0x204, waitcnt);
    bus.postflg = postflg;
    bus.halt_requested = halt_requested;
    bus.cycles = cycles;
    bus.dma_latch = dma_latch;
    bus.video = video;
    bus.irq = irq;
    bus.timers = timers;
    bus.dma = dma;
    bus.keypad = keypad;
    if let Some(cart) = bus.cart.as_mut() {
        cart.backup = backup;
    }
    machine.ppu = ppu;
    Ok(())
}

fn write_access(w: &mut StateWriter, access: Access) {
    w.u8(match access {
        Access::NonSeq => 0,
        Access::Seq => 1,
    });
}

fn write_cpu(w: &mut StateWriter, cpu: &Cpu) {
    let regs = &cpu.regs;
    regs.r.iter().for_each(|&r| w.u32(r));
    w.u32(regs.cpsr);
    regs.banked_sp_lr.iter().flatten().for_each(|&r| w.u32(r));
    regs.banked_r8_r12.iter().flatten().for_each(|&r| w.u32(r));
    regs.spsr.iter().for_each(|&r| w.u32(r));
    w.bool(cpu.halted);
    write_access(w, cpu.next_fetch);
    w.bool(cpu.hle_swi);
    w.bool(cpu.intr_wait_resume);
    match cpu.fault {
        None => w.u8(0),
        Some(CpuError::IllegalInstruction {
            address,
            opcode,
            thumb,
        }) => {
            w.u8(1);
            w.u32(address);
            w.u32(opcode);
            w.bool(thumb);
        }
    }
}

fn read_cpu(r: &mut StateReader, cpu: &mut Cpu) -> Result<()> {
    let regs = &mut cpu.regs;
    for v in regs.r.iter_mut() {
        *v = r.u32()?;
    }
    regs.cpsr = r.u32()?;
    ensure(Mode::from_bits(regs.cpsr).is_some(), "CPU mode")?;
    for v in regs.banked_sp_lr.iter_mut().flatten() {
        *v = r.u32()?;
    }
    for v in regs.banked_r8_r12.iter_mut().flatten() {
        *v = r.u32()?;
    }
    for v in regs.spsr.iter_mut() {
        *v = r.u32()?;
    }
    cpu.halted = r.bool()?;
    cpu.next_fetch = if r.u8()? == 0 {
        Access::NonSeq
    } else {
        Access::Seq
    };
    cpu.hle_swi = r.bool()?;
    cpu.intr_wait_resume = r.bool()?;
    cpu.fault = match r.u8()? {
        0 => None,
        _ => Some(CpuError::IllegalInstruction {
            address: r.u32()?,
            opcode: r.u32()?,
            thumb: r.bool()?,
        }),
    };
    Ok(())
}

fn write_video(w: &mut StateWriter, video: &Video) {
    w.bytes(&video.vram);
    w.bytes(&video.palette);
    w.bytes(&video.oam);
    for v in [video.dispcnt, video.green_swap, video.dispstat, video.vcount] {
        w.u16(v);
    }
    for v in video.bgcnt.iter().chain(&video.bg_hofs).chain(&video.bg_vofs) {
        w.u16(*v);
    }
    for p in &video.affine {
        for v in [p.pa, p.pb, p.pc, p.pd] {
            w.u16(v as u16);
        }
        for v in [p.x, p.y, p.internal_x, p.internal_y] {
            w.i32(v);
        }
    }
    for v in video.win_h.iter().chain(&video.win_v) {
        w.u16(*v);
    }
    for v in [
        video.winin,
        video.winout,
        video.mosaic,
        video.bldcnt,
        video.bldalpha,
        video.bldy,
    ] {
        w.u16(v);
    }
}

fn read_video(r: &mut StateReader, video: &mut Video) -> Result<()> {
    r.bytes_into("VRAM", &mut video.vram)?;
    r.bytes_into("palette RAM", &mut video.palette)?;
    r.bytes_into("OAM", &mut video.oam)?;
    video.dispcnt = r.u16()?;
    video.green_swap = r.u16()?;
    video.dispstat = r.u16()?;
    video.vcount = r.u16()?;
    for v in video
        .bgcnt
        .iter_mut()
        .chain(video.bg_hofs.iter_mut())
        .chain(video.bg_vofs.iter_mut())
    {
        *v = r.u16()?;
    }
    for p in video.affine.iter_mut() {
        for v in [&mut p.pa, &mut p.pb, &mut p.pc, &mut p.pd] {
            *v = r.u16()? as i16;
        }
        for v in [&mut p.x, &mut p.y, &mut p.internal_x, &mut p.internal_y] {
            *v = r.i32()?;
        }
    }
    for v in video.win_h.iter_mut().chain(video.win_v.iter_mut()) {
        *v = r.u16()?;
    }
    for v in [
        &mut video.winin,
        &mut video.winout,
        &mut video.mosaic,
        &mut video.bldcnt,
        &mut video.bldalpha,
        &mut video.bldy,
    ] {
        *v = r.u16()?;
    }
    Ok(())
}

fn backup_kind(backup: &Backup) -> (u8, &'static str) {
    match backup {
        Backup::None => (0, "no"),
        Backup::Sram(_) => (1, "SRAM"),
        Backup::Flash(_) => (2, "Flash"),
        Backup::Eeprom(_) => (3, "EEPROM"),
    }
}

fn backup_kind_name(kind: u8) -> &'static str {
    match kind {
        0 => "no",
        1 => "SRAM",
        2 => "Flash",
        3 => "EEPROM",
        _ => "unknown",
    }
}

fn write_backup(w: &mut StateWriter, backup: &Backup) {
    w.u8(backup_kind(backup).0);
    match backup {
        Backup::None => {}
        Backup::Sram(data) => w.bytes(data),
        Backup::Flash(flash) => {
            w.bytes(&flash.data);
            w.u8(match flash.mode {
                FlashMode::Ready => 0,
                FlashMode::Command1 => 1,
                FlashMode::Command2 => 2,
            });
            w.bool(flash.id_mode);
            w.bool(flash.erase_armed);
            w.bool(flash.write_next);
            w.bool(flash.bank_next);
            w.u8(flash.bank);
        }
        Backup::Eeprom(eeprom) => {
            w.bytes(&eeprom.data);
            match eeprom.state {
                EepromState::Idle => w.u8(0),
                EepromState::Receiving => w.u8(1),
                EepromState::Reading { pos } => {
                    w.u8(2);
                    w.u32(pos);
                }
            }
            w.u8(eeprom.addr_bits.unwrap_or(0) as u8);
            w.buf.extend_from_slice(&eeprom.buffer.to_le_bytes());
            w.u32(eeprom.received);
            w.u32(eeprom.read_addr);
        }
    }
}

fn read_backup(r: &mut StateReader, backup: &mut Backup) -> Result<()> {
    let (expected, expected_name) = backup_kind(backup);
    let found = r.u8()?;
    if found != expected {
        return Err(StateError::BackupMismatch {
            expected: expected_name,
            found: backup_kind_name(found),
        });
    }
    match backup {
        Backup::None => {}
        Backup::Sram(data) => r.bytes_into("SRAM", data)?,
        Backup::Flash(flash) => {
            r.bytes_into("Flash", &mut flash.data)?;
            flash.mode = match r.u8()? {
                1 => FlashMode::Command1,
                2 => FlashMode::Command2,
                _ => FlashMode::Ready,
            };
            flash.id_mode = r.bool()?;
            flash.erase_armed = r.bool()?;
            flash.write_next = r.bool()?;
            flash.bank_next = r.bool()?;
            flash.bank = r.u8()?;
            ensure((flash.bank as usize) < flash.banks(), "Flash bank")?;
        }
        Backup::Eeprom(eeprom) => {
            r.bytes_into("EEPROM", &mut eeprom.data)?;
            eeprom.state = match r.u8()? {
                1 => EepromState::Receiving,
                2 => {
                    let pos = r.u32()?;
                    ensure(pos < EEPROM_READ_BITS, "EEPROM read position")?;
                    EepromState::Reading { pos }
                }
                _ => EepromState::Idle,
            };
            eeprom.addr_bits = match r.u8()? {
                0 => None,
                bits @ (6 | 14) => Some(bits as u32),
                _ => return Err(StateError::Corrupt("EEPROM address width")),
            };
            eeprom.buffer = u128::from_le_bytes(r.array()?);
            eeprom.received = r.u32()?;
            ensure(
                eeprom.received <= eeprom.longest_command(),
                "EEPROM bit count",
            )?;
            eeprom.read_addr = r.u32()?;
        }
    }
    Ok(())
}
