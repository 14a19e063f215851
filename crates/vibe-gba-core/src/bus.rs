use crate::{
    cartridge::{BIOS_SIZE, Cartridge, LoadError},
    config::MachineConfig,
    dma::{Dma, DmaTiming},
    input::Keypad,
    interrupt::{Interrupt, InterruptState},
    timer::Timers,
    video::Video,
};

pub const EWRAM_SIZE: usize = 0x4_0000;
pub const IWRAM_SIZE: usize = 0x8000;
pub const IO_SIZE: usize = 0x400;

#[cfg(feature = "cpu-trace")]
macro_rules! bus_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "vibe_gba_core::bus", $($arg)*);
    };
}
#[cfg(not(feature = "cpu-trace"))]
macro_rules! bus_trace {
    ($($arg:tt)*) => {};
}

/// Access width on the data bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }
}

/// Non-sequential accesses pay the full first-access wait; sequential ones
/// continue a burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    NonSeq,
    Seq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionId {
    Bios,
    Ewram,
    Iwram,
    Io,
    Palette,
    Vram,
    Oam,
    Rom0,
    Rom1,
    Rom2,
    Sram,
    Unmapped,
}

const REGION_COUNT: usize = 12;

/// Region by address bits 24-27 (for addresses below 0x1000_0000).
const REGION_LOOKUP: [RegionId; 16] = [
    RegionId::Bios,
    RegionId::Unmapped,
    RegionId::Ewram,
    RegionId::Iwram,
    RegionId::Io,
    RegionId::Palette,
    RegionId::Vram,
    RegionId::Oam,
    RegionId::Rom0,
    RegionId::Rom0,
    RegionId::Rom1,
    RegionId::Rom1,
    RegionId::Rom2,
    RegionId::Rom2,
    RegionId::Sram,
    RegionId::Sram,
];

#[inline]
pub fn region_of(addr: u32) -> RegionId {
    if addr >= 0x1000_0000 {
        return RegionId::Unmapped;
    }
    REGION_LOOKUP[(addr >> 24) as usize]
}

/// Cycle cost of one access, including the first cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitStates {
    pub n16: u8,
    pub s16: u8,
    pub n32: u8,
    pub s32: u8,
}

impl WaitStates {
    const fn flat(cycles: u8) -> Self {
        Self {
            n16: cycles,
            s16: cycles,
            n32: cycles,
            s32: cycles,
        }
    }

    /// A 16-bit bus splits word accesses into two halfword accesses.
    const fn narrow(n16: u8, s16: u8) -> Self {
        Self {
            n16,
            s16,
            n32: n16 + s16,
            s32: s16 + s16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub id: RegionId,
    pub base: u32,
    pub size: u32,
    /// Offset mask applied before indexing the backing store.
    pub mirror: u32,
    /// Data bus width in bits.
    pub bus_width: u8,
    pub wait: WaitStates,
}

impl MemoryRegion {
    #[inline]
    pub fn cycles(&self, width: Width, access: Access) -> u32 {
        let c = match (width, access) {
            (Width::Word, Access::NonSeq) => self.wait.n32,
            (Width::Word, Access::Seq) => self.wait.s32,
            (_, Access::NonSeq) => self.wait.n16,
            (_, Access::Seq) => self.wait.s16,
        };
        c as u32
    }
}

// WAITCNT field decoding (GBATEK "GBA System Control").
const WAIT_N: [u8; 4] = [4, 3, 2, 8];
const WAIT_S0: [u8; 2] = [2, 1];
const WAIT_S1: [u8; 2] = [4, 1];
const WAIT_S2: [u8; 2] = [8, 1];

fn region_table(waitcnt: u16) -> [MemoryRegion; REGION_COUNT] {
    let sram = 1 + WAIT_N[(waitcnt & 3) as usize];
    let rom = |n_shift: u16, s_bit: u16, s_table: [u8; 2]| {
        let n = 1 + WAIT_N[((waitcnt >> n_shift) & 3) as usize];
        let s = 1 + s_table[((waitcnt >> s_bit) & 1) as usize];
        WaitStates::narrow(n, s)
    };
    let region = |id, base, size: u32, bus_width, wait| MemoryRegion {
        id,
        base,
        size,
        mirror: size.wrapping_sub(1),
        bus_width,
        wait,
    };
    [
        region(RegionId::Bios, 0x0000_0000, 0x4000, 32, WaitStates::flat(1)),
        region(RegionId::Ewram, 0x0200_0000, 0x4_0000, 16, WaitStates::narrow(3, 3)),
        region(RegionId::Iwram, 0x0300_0000, 0x8000, 32, WaitStates::flat(1)),
        region(RegionId::Io, 0x0400_0000, 0x400, 32, WaitStates::flat(1)),
        region(RegionId::Palette, 0x0500_0000, 0x400, 16, WaitStates::narrow(1, 1)),
        region(RegionId::Vram, 0x0600_0000, 0x1_8000, 16, WaitStates::narrow(1, 1)),
        region(RegionId::Oam, 0x0700_0000, 0x400, 32, WaitStates::flat(1)),
        region(RegionId::Rom0, 0x0800_0000, 0x200_0000, 16, rom(2, 4, WAIT_S0)),
        region(RegionId::Rom1, 0x0A00_0000, 0x200_0000, 16, rom(5, 7, WAIT_S1)),
        region(RegionId::Rom2, 0x0C00_0000, 0x200_0000, 16, rom(8, 10, WAIT_S2)),
        region(RegionId::Sram, 0x0E00_0000, 0x1_0000, 8, WaitStates::flat(sram)),
        region(RegionId::Unmapped, 0, 0, 32, WaitStates::flat(1)),
    ]
}

/// Built-in stand-in for the BIOS when no image is supplied: vectors plus
/// the stock IRQ dispatcher at 0x128. SWIs are handled in
/// [`crate::cpu::hle`] and never reach this code.
fn stub_bios() -> Box<[u8]> {
    const WORDS: [(usize, u32); 14] = [
        (0x00, 0xE3A0_F302), // mov pc, #0x08000000
        (0x04, 0xE1B0_F00E), // movs pc, lr
        (0x08, 0xE1B0_F00E), // movs pc, lr
        (0x0C, 0xE25E_F004), // subs pc, lr, #4
        (0x10, 0xE25E_F008), // subs pc, lr, #8
        (0x14, 0xE1B0_F00E), // movs pc, lr
        (0x18, 0xEA00_0042), // b 0x128
        (0x1C, 0xE25E_F004), // subs pc, lr, #4
        (0x128, 0xE92D_500F), // stmfd sp!, {r0-r3, r12, lr}
        (0x12C, 0xE3A0_0301), // mov r0, #0x04000000
        (0x130, 0xE28F_E000), // add lr, pc, #0
        (0x134, 0xE510_F004), // ldr pc, [r0, #-4]
        (0x138, 0xE8BD_500F), // ldmfd sp!, {r0-r3, r12, lr}
        (0x13C, 0xE25E_F004), // subs pc, lr, #4
    ];
    let mut bios = vec![0u8; BIOS_SIZE];
    for (offset, word) in WORDS {
        bios[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }
    bios.into_boxed_slice()
}

#[inline]
fn fetch(buf: &[u8], index: usize, width: Width) -> u32 {
    match width {
        Width::Byte => buf[index] as u32,
        Width::Half => u16::from_le_bytes([buf[index], buf[index + 1]]) as u32,
        Width::Word => u32::from_le_bytes([
            buf[index],
            buf[index + 1],
            buf[index + 2],
            buf[index + 3],
        ]),
    }
}

#[inline]
fn store(buf: &mut [u8], index: usize, width: Width, value: u32) {
    match width {
        Width::Byte => buf[index] = value as u8,
        Width::Half => buf[index..index + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        Width::Word => buf[index..index + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

pub struct Bus {
    pub bios: Box<[u8]>,
    bios_loaded: bool,
    pub ewram: Box<[u8]>,
    pub iwram: Box<[u8]>,
    pub video: Video,
    pub cart: Option<Cartridge>,
    pub irq: InterruptState,
    pub timers: Timers,
    pub dma: Dma,
    pub keypad: Keypad,
    /// Last value written to every I/O halfword. Backs read-modify-write for
    /// byte writes and plain storage for registers without behavior (sound,
    /// serial).
    pub io_latch: Box<[u16]>,
    pub waitcnt: u16,
    pub postflg: u8,
    pub halt_requested: bool,
    /// Master cycle counter. Every bus access and CPU internal cycle lands
    /// here; the scheduler derives all other timing from it.
    pub cycles: u64,
    /// Last value moved by DMA; returned for DMA reads from the BIOS area.
    pub dma_latch: u32,
    regions: [MemoryRegion; REGION_COUNT],
    open_bus: u32,
}

impl Bus {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            bios: stub_bios(),
            bios_loaded: false,
            ewram: vec![0; EWRAM_SIZE].into_boxed_slice(),
            iwram: vec![0; IWRAM_SIZE].into_boxed_slice(),
            video: Video::new(),
            cart: None,
            irq: InterruptState::new(),
            timers: Timers::new(),
            dma: Dma::new(),
            keypad: Keypad::new(),
            io_latch: vec![0; IO_SIZE / 2].into_boxed_slice(),
            waitcnt: 0,
            postflg: 0,
            halt_requested: false,
            cycles: 0,
            dma_latch: 0,
            regions: region_table(0),
            open_bus: config.open_bus_value,
        }
    }

    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), LoadError> {
        if data.len() != BIOS_SIZE {
            return Err(LoadError::BiosSize { len: data.len() });
        }
        self.bios = data.to_vec().into_boxed_slice();
        self.bios_loaded = true;
        Ok(())
    }

    /// A real BIOS image is mapped (as opposed to the built-in stub).
    pub fn bios_loaded(&self) -> bool {
        self.bios_loaded
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    /// Put every volatile part of the bus back to power-on values; BIOS and
    /// cartridge stay.
    pub fn reset(&mut self) {
        self.ewram.fill(0);
        self.iwram.fill(0);
        self.video = Video::new();
        self.irq = InterruptState::new();
        self.timers = Timers::new();
        self.dma = Dma::new();
        let pressed = self.keypad.pressed_mask();
        self.keypad = Keypad::new();
        self.keypad.restore_pressed(pressed);
        self.io_latch.fill(0);
        self.postflg = 0;
        self.halt_requested = false;
        self.cycles = 0;
        self.dma_latch = 0;
        self.set_waitcnt(0);
    }

    pub fn open_bus_value(&self) -> u32 {
        self.open_bus
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        &self.regions[id as usize]
    }

    fn set_waitcnt(&mut self, value: u16) {
        // Bit 15 (game pak type) is read-only and reads as 0 for GBA carts.
        self.waitcnt = value & 0x5FFF;
        self.regions = region_table(self.waitcnt);
    }

    /// Charge `cycles` CPU internal cycles.
    #[inline]
    pub fn idle(&mut self, cycles: u32) {
        self.cycles += cycles as u64;
    }

    #[inline]
    pub fn take_halt_request(&mut self) -> bool {
        std::mem::take(&mut self.halt_requested)
    }

    /// Read with non-sequential timing.
    pub fn read(&mut self, addr: u32, width: Width) -> u32 {
        self.read_access(addr, width, Access::NonSeq)
    }

    pub fn write(&mut self, addr: u32, width: Width, value: u32) {
        self.write_access(addr, width, value, Access::NonSeq)
    }

    /// Timed read. Misaligned halfword and word reads return the aligned
    /// value rotated right by the misalignment, as the ARM7TDMI sees it.
    pub fn read_access(&mut self, addr: u32, width: Width, access: Access) -> u32 {
        let region = region_of(addr);
        self.cycles += self.regions[region as usize].cycles(width, access) as u64;
        let aligned = addr & !(width.bytes() - 1);

        let value = if region == RegionId::Rom2 && self.eeprom_selected(aligned) {
            match self.cart.as_mut().map(|c| &mut c.backup) {
                Some(crate::backup::Backup::Eeprom(eeprom)) => eeprom.read_bit() as u32,
                _ => 1,
            }
        } else {
            self.load(aligned, width)
        };

        let rotate = (addr & (width.bytes() - 1)) * 8;
        if rotate == 0 {
            value
        } else {
            value.rotate_right(rotate)
        }
    }

    /// Untimed, side-effect free read for debuggers and tests.
    pub fn peek(&self, addr: u32, width: Width) -> u32 {
        self.load(addr & !(width.bytes() - 1), width)
    }

    #[inline]
    fn mirrored(&self, id: RegionId, addr: u32) -> usize {
        (addr & self.regions[id as usize].mirror) as usize
    }

    fn eeprom_selected(&self, addr: u32) -> bool {
        self.cart.as_ref().is_some_and(|c| c.eeprom_selected(addr))
    }

    fn unmapped_read(&self, addr: u32) -> u32 {
        log::debug!("unmapped read at {addr:08X}");
        self.open_bus
    }

    fn load(&self, addr: u32, width: Width) -> u32 {
        match region_of(addr) {
            RegionId::Bios if addr < BIOS_SIZE as u32 => fetch(&self.bios, addr as usize, width),
            RegionId::Ewram => fetch(&self.ewram, self.mirrored(RegionId::Ewram, addr), width),
            RegionId::Iwram => fetch(&self.iwram, self.mirrored(RegionId::Iwram, addr), width),
            RegionId::Io => self.load_io(addr, width),
            RegionId::Palette => fetch(
                &self.video.palette,
                self.mirrored(RegionId::Palette, addr),
                width,
            ),
            RegionId::Vram => fetch(&self.video.vram, Video::vram_index(addr), width),
            RegionId::Oam => fetch(&self.video.oam, self.mirrored(RegionId::Oam, addr), width),
            RegionId::Rom0 | RegionId::Rom1 | RegionId::Rom2 => match &self.cart {
                Some(cart) => {
                    let offset = addr & 0x01FF_FFFF;
                    match width {
                        Width::Byte => (cart.read_rom16(offset) >> ((addr & 1) * 8)) as u32 & 0xFF,
                        Width::Half => cart.read_rom16(offset) as u32,
                        Width::Word => {
                            cart.read_rom16(offset) as u32
                                | (cart.read_rom16(offset + 2) as u32) << 16
                        }
                    }
                }
                None => self.unmapped_read(addr),
            },
            RegionId::Sram => {
                let byte = self
                    .cart
                    .as_ref()
                    .and_then(|c| c.backup.read_sram_window(addr & 0xFFFF))
                    .unwrap_or(0xFF) as u32;
                match width {
                    Width::Byte => byte,
                    Width::Half => byte * 0x0101,
                    Width::Word => byte * 0x0101_0101,
                }
            }
            _ => self.unmapped_read(addr),
        }
    }

    fn load_io(&self, addr: u32, width: Width) -> u32 {
        let offset = addr & 0x00FF_FFFF;
        if offset >= IO_SIZE as u32 {
            return self.unmapped_read(addr);
        }
        let half = |off: u32| -> u32 {
            match self.read_io(off) {
                Some(v) => v as u32,
                None => {
                    bus_trace!("read of unreadable I/O register {:03X}", off);
                    self.open_bus & 0xFFFF
                }
            }
        };
        match width {
            Width::Byte => (half(offset & !1) >> ((offset & 1) * 8)) & 0xFF,
            Width::Half => half(offset),
            Width::Word => half(offset) | half(offset + 2) << 16,
        }
    }

    /// Halfword register read by offset from 0x0400_0000.
    pub fn read_io(&self, offset: u32) -> Option<u16> {
        let value = match offset {
            0x000..=0x056 => return self.video.read_reg(offset),
            0x060..=0x0AE => self.io_latch[(offset / 2) as usize],
            0x0BA | 0x0C6 | 0x0D2 | 0x0DE => self.dma.channels[((offset - 0x0BA) / 12) as usize].control,
            0x0B8 | 0x0C4 | 0x0D0 | 0x0DC => 0,
            0x100 | 0x104 | 0x108 | 0x10C => self.timers.read_counter(((offset - 0x100) / 4) as usize),
            0x102 | 0x106 | 0x10A | 0x10E => self.timers.read_control(((offset - 0x100) / 4) as usize),
            0x120..=0x12A | 0x134 | 0x140 | 0x150..=0x158 => self.io_latch[(offset / 2) as usize],
            0x130 => self.keypad.keyinput(),
            0x132 => self.keypad.keycnt,
            0x200 => self.irq.enable,
            0x202 => self.irq.flags,
            0x204 => self.waitcnt,
            0x206 | 0x20A => 0,
            0x208 => self.irq.master_enable as u16,
            0x300 => self.postflg as u16,
            _ => return None,
        };
        Some(value)
    }

    pub fn write_access(&mut self, addr: u32, width: Width, value: u32, access: Access) {
        let region = region_of(addr);
        self.cycles += self.regions[region as usize].cycles(width, access) as u64;
        let aligned = addr & !(width.bytes() - 1);

        match region {
            RegionId::Ewram => {
                let index = self.mirrored(RegionId::Ewram, aligned);
                store(&mut self.ewram, index, width, value)
            }
            RegionId::Iwram => {
                let index = self.mirrored(RegionId::Iwram, aligned);
                store(&mut self.iwram, index, width, value)
            }
            RegionId::Io => self.store_io(aligned, width, value),
            RegionId::Palette => match width {
                Width::Byte => self.video.write_palette8(aligned & 0x3FF, value as u8),
                _ => {
                    let index = self.mirrored(RegionId::Palette, aligned);
                    store(&mut self.video.palette, index, width, value)
                }
            },
            RegionId::Vram => match width {
                Width::Byte => self.video.write_vram8(aligned, value as u8),
                _ => store(&mut self.video.vram, Video::vram_index(aligned), width, value),
            },
            RegionId::Oam => {
                if width != Width::Byte {
                    let index = self.mirrored(RegionId::Oam, aligned);
                    store(&mut self.video.oam, index, width, value);
                }
            }
            RegionId::Rom2 if self.eeprom_selected(aligned) => {
                if let Some(crate::backup::Backup::Eeprom(eeprom)) =
                    self.cart.as_mut().map(|c| &mut c.backup)
                {
                    eeprom.write_bit(value as u16);
                }
            }
            RegionId::Sram => {
                let lane = (addr & (width.bytes() - 1)) * 8;
                if let Some(cart) = self.cart.as_mut() {
                    cart.backup.write_sram_window(addr & 0xFFFF, (value >> lane) as u8);
                }
            }
            RegionId::Bios | RegionId::Rom0 | RegionId::Rom1 | RegionId::Rom2 => {
                bus_trace!("ignored write to read-only {:08X}", addr);
            }
            RegionId::Unmapped => log::debug!("unmapped write at {addr:08X} = {value:08X}"),
        }
    }

    fn store_io(&mut self, addr: u32, width: Width, value: u32) {
        let offset = addr & 0x00FF_FFFF;
        if offset >= IO_SIZE as u32 {
            log::debug!("unmapped I/O write at {addr:08X}");
            return;
        }
        match width {
            Width::Byte => self.write_io8(offset, value as u8),
            Width::Half => self.write_io16(offset, value as u16),
            Width::Word => {
                self.write_io16(offset, value as u16);
                self.write_io16(offset + 2, (value >> 16) as u16);
            }
        }
    }

    fn write_io8(&mut self, offset: u32, val: u8) {
        match offset {
            // IF is write-one-to-clear; the other byte must not be replayed.
            0x202 | 0x203 => self.write_io16(0x202, (val as u16) << ((offset & 1) * 8)),
            0x300 => self.postflg = val & 1,
            0x301 => self.write_haltcnt(val),
            _ => {
                let latched = self.io_latch[(offset / 2) as usize];
                let value = if offset & 1 == 0 {
                    (latched & 0xFF00) | val as u16
                } else {
                    (latched & 0x00FF) | (val as u16) << 8
                };
                self.write_io16(offset & !1, value);
            }
        }
    }

    fn write_haltcnt(&mut self, val: u8) {
        bus_trace!("HALTCNT <- {:02X}", val);
        if val & 0x80 != 0 {
            // STOP sleeps like HALT; a keypad or timer IRQ still wakes it.
            log::debug!("STOP requested, halting instead");
        }
        self.halt_requested = true;
    }

    /// Halfword register write by offset from 0x0400_0000.
    pub fn write_io16(&mut self, offset: u32, value: u16) {
        match offset {
            0x000..=0x056 => self.video.write_reg(offset, value),
            0x0B0..=0x0DF => self.write_dma_reg(offset, value),
            0x100..=0x10E => {
                let index = ((offset - 0x100) / 4) as usize;
                if offset & 2 == 0 {
                    self.timers.write_reload(index, value);
                } else {
                    self.timers.write_control(index, value);
                }
            }
            0x132 => {
                self.keypad.write_keycnt(value);
                self.update_keypad_irq();
            }
            0x200 => self.irq.write_enable(value),
            0x202 => self.irq.acknowledge(value),
            0x204 => self.set_waitcnt(value),
            0x208 => self.irq.write_master_enable(value),
            0x300 => {
                self.postflg = value as u8 & 1;
                self.write_haltcnt((value >> 8) as u8);
            }
            _ => {}
        }
        if (offset as usize) < IO_SIZE {
            self.io_latch[(offset / 2) as usize] = value;
        }
    }

    fn write_dma_reg(&mut self, offset: u32, value: u16) {
        let index = ((offset - 0x0B0) / 12) as usize;
        let reg = (offset - 0x0B0) % 12;
        // Latch first so 32-bit address registers can be assembled.
        self.io_latch[(offset / 2) as usize] = value;
        let base = 0x0B0 + index as u32 * 12;
        let word = |bus: &Bus, off: u32| -> u32 {
            bus.io_latch[(off / 2) as usize] as u32 | (bus.io_latch[(off / 2 + 1) as usize] as u32) << 16
        };
        match reg {
            0 | 2 => {
                let src = word(self, base);
                self.dma.write_src(index, src);
            }
            4 | 6 => {
                let dst = word(self, base + 4);
                self.dma.write_dst(index, dst);
            }
            8 => self.dma.write_count(index, value),
            _ => {
                if self.dma.write_control(index, value) {
                    self.run_dma(index);
                }
            }
        }
    }

    pub fn update_keypad_irq(&mut self) {
        if self.keypad.irq_condition() {
            self.irq.request(Interrupt::Keypad);
        }
    }

    /// Start every channel waiting on `timing`.
    pub fn trigger_dma(&mut self, timing: DmaTiming) {
        let mut pending = [false; 4];
        for index in self.dma.triggered(timing) {
            pending[index] = true;
        }
        for (index, start) in pending.into_iter().enumerate() {
            if start {
                self.run_dma(index);
            }
        }
    }

    /// Run one block of channel `index` to completion.
    pub fn run_dma(&mut self, index: usize) {
        let ch = self.dma.channels[index];
        let width = if ch.word_sized() { Width::Word } else { Width::Half };
        let unit = width.bytes();
        let src_step = ch.src_control().step(unit);
        let dst_step = ch.dest_control().step(unit);
        let count = ch.internal_count;
        let mut src = ch.internal_src & !(unit - 1);
        let mut dst = ch.internal_dst & !(unit - 1);

        if index == 3
            && let Some(crate::backup::Backup::Eeprom(eeprom)) =
                self.cart.as_mut().map(|c| &mut c.backup)
            && (src >> 24 == 0x0D || dst >> 24 == 0x0D)
        {
            eeprom.hint_transfer_len(count);
        }

        bus_trace!(
            "DMA{} {:08X} -> {:08X} x{} ({:?})",
            index,
            src,
            dst,
            count,
            ch.timing()
        );

        let mut access = Access::NonSeq;
        for _ in 0..count {
            let value = if src < 0x0200_0000 {
                self.idle(1);
                self.dma_latch
            } else {
                let v = self.read_access(src, width, access);
                self.dma_latch = if width == Width::Half { v * 0x0001_0001 } else { v };
                v
            };
            self.write_access(dst, width, value, access);
            src = src.wrapping_add(src_step);
            dst = dst.wrapping_add(dst_step);
            access = Access::Seq;
        }
        self.idle(2);

        let ch = &mut self.dma.channels[index];
        ch.internal_src = src;
        ch.internal_dst = dst;
        ch.internal_count = 0;
        let irq = ch.irq_on_end();
        self.dma.finish(index);
        if irq {
            self.irq.request(Interrupt::dma(index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Bus {
        Bus::new(&MachineConfig::default())
    }

    #[test]
    fn region_lookup_by_top_byte() {
        assert_eq!(region_of(0x0300_7FFC), RegionId::Iwram);
        assert_eq!(region_of(0x0DFF_FF00), RegionId::Rom2);
        assert_eq!(region_of(0x0100_0000), RegionId::Unmapped);
        assert_eq!(region_of(0x1000_0000), RegionId::Unmapped);
    }

    #[test]
    fn regions_do_not_overlap() {
        let table = region_table(0);
        let mut mapped: Vec<_> = table.iter().filter(|r| r.size > 0).collect();
        mapped.sort_by_key(|r| r.base);
        for pair in mapped.windows(2) {
            assert!(pair[0].base + pair[0].size <= pair[1].base, "{:?}", pair);
        }
    }

    #[test]
    fn unmapped_read_returns_open_bus_value() {
        let config = MachineConfig {
            open_bus_value: 0xDEAD_BEEF,
            ..MachineConfig::default()
        };
        let mut bus = Bus::new(&config);
        assert_eq!(bus.read(0x0100_0000, Width::Word), 0xDEAD_BEEF);
        assert_eq!(bus.read(0x1234_5678, Width::Word), 0xDEAD_BEEF);
    }

    #[test]
    fn misaligned_word_read_rotates() {
        let mut bus = bus();
        bus.write(0x0300_0000, Width::Word, 0x1122_3344);
        assert_eq!(bus.read(0x0300_0001, Width::Word), 0x4411_2233);
        assert_eq!(bus.read(0x0300_0001, Width::Half), 0x4400_0033);
    }

    #[test]
    fn misaligned_writes_are_force_aligned() {
        let mut bus = bus();
        bus.write(0x0300_0003, Width::Word, 0xAABB_CCDD);
        assert_eq!(bus.peek(0x0300_0000, Width::Word), 0xAABB_CCDD);
    }

    #[test]
    fn memory_mirrors() {
        let mut bus = bus();
        bus.write(0x0200_0010, Width::Byte, 0x5A);
        assert_eq!(bus.read(0x0204_0010, Width::Byte), 0x5A);
        bus.write(0x0300_0010, Width::Byte, 0xA5);
        assert_eq!(bus.read(0x03FF_8010, Width::Byte), 0xA5);
    }

    #[test]
    fn wait_states_follow_region_and_waitcnt() {
        let mut bus = bus();
        let start = bus.cycles;
        bus.read(0x0300_0000, Width::Word);
        assert_eq!(bus.cycles - start, 1);

        let start = bus.cycles;
        bus.read(0x0200_0000, Width::Word);
        assert_eq!(bus.cycles - start, 6);

        let start = bus.cycles;
        bus.read_access(0x0800_0000, Width::Half, Access::NonSeq);
        bus.read_access(0x0800_0002, Width::Half, Access::Seq);
        assert_eq!(bus.cycles - start, 5 + 3);

        // WS0 N=3, S=1.
        bus.write(0x0400_0204, Width::Half, 0x0014);
        let start = bus.cycles;
        bus.read_access(0x0800_0000, Width::Half, Access::NonSeq);
        bus.read_access(0x0800_0002, Width::Half, Access::Seq);
        assert_eq!(bus.cycles - start, 4 + 2);
    }

    #[test]
    fn interrupt_flags_write_one_to_clear() {
        let mut bus = bus();
        bus.irq.flags = 0x0003;
        bus.write(0x0400_0202, Width::Byte, 0x01);
        assert_eq!(bus.irq.flags, 0x0002);
        bus.write(0x0400_0202, Width::Byte, 0x02);
        assert_eq!(bus.irq.flags, 0x0000);
    }

    #[test]
    fn io_byte_writes_merge_with_latch() {
        let mut bus = bus();
        bus.write(0x0400_0000, Width::Half, 0x1234);
        bus.write(0x0400_0001, Width::Byte, 0xAB);
        assert_eq!(bus.video.dispcnt, 0xAB34);
    }

    #[test]
    fn immediate_dma_copies_words() {
        let mut bus = bus();
        for i in 0..4u32 {
            bus.write(0x0200_0000 + i * 4, Width::Word, 0x1000 + i);
        }
        bus.write(0x0400_00D4, Width::Word, 0x0200_0000);
        bus.write(0x0400_00D8, Width::Word, 0x0300_0100);
        bus.write(0x0400_00DC, Width::Word, 0xC400_0004);

        for i in 0..4u32 {
            assert_eq!(bus.peek(0x0300_0100 + i * 4, Width::Word), 0x1000 + i);
        }
        assert!(!bus.dma.channels[3].enabled());
        assert_eq!(bus.irq.flags, Interrupt::Dma3.mask());
    }

    #[test]
    fn haltcnt_write_requests_halt() {
        let mut bus = bus();
        bus.write(0x0400_0301, Width::Byte, 0);
        assert!(bus.take_halt_request());
        assert!(!bus.take_halt_request());

        // STOP halts as well.
        bus.write(0x0400_0301, Width::Byte, 0x80);
        assert!(bus.take_halt_request());
    }

    #[test]
    fn keyinput_reads_active_low() {
        let mut bus = bus();
        bus.keypad.press(crate::input::Button::A);
        assert_eq!(bus.read(0x0400_0130, Width::Half), 0x03FE);
    }
}
