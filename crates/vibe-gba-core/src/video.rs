//! Video memory (VRAM, palette RAM, OAM) and the LCD I/O registers.
//!
//! The bus owns this block and routes CPU/DMA accesses to it; the PPU reads
//! it while rendering and only touches the status fields (DISPSTAT flags,
//! VCOUNT, the affine line counters).

pub const VRAM_SIZE: usize = 0x1_8000;
pub const PALETTE_SIZE: usize = 0x400;
pub const OAM_SIZE: usize = 0x400;

// DISPCNT
pub const DISPCNT_MODE: u16 = 0x0007;
pub const DISPCNT_FRAME_SELECT: u16 = 0x0010;
pub const DISPCNT_OBJ_1D: u16 = 0x0040;
pub const DISPCNT_FORCED_BLANK: u16 = 0x0080;
pub const DISPCNT_BG0: u16 = 0x0100;
pub const DISPCNT_OBJ: u16 = 0x1000;
pub const DISPCNT_WIN0: u16 = 0x2000;
pub const DISPCNT_WIN1: u16 = 0x4000;
pub const DISPCNT_OBJWIN: u16 = 0x8000;

// DISPSTAT
pub const DISPSTAT_VBLANK: u16 = 0x0001;
pub const DISPSTAT_HBLANK: u16 = 0x0002;
pub const DISPSTAT_VCOUNT: u16 = 0x0004;
pub const DISPSTAT_VBLANK_IRQ: u16 = 0x0008;
pub const DISPSTAT_HBLANK_IRQ: u16 = 0x0010;
pub const DISPSTAT_VCOUNT_IRQ: u16 = 0x0020;
const DISPSTAT_WRITABLE: u16 = 0xFF38;

/// First VRAM byte that belongs to OBJ tiles in the tiled modes.
pub const OBJ_VRAM_TILED: u32 = 0x1_0000;
/// Same boundary in the bitmap modes.
pub const OBJ_VRAM_BITMAP: u32 = 0x1_4000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AffineParams {
    pub pa: i16,
    pub pb: i16,
    pub pc: i16,
    pub pd: i16,
    /// Reference point as written (20.8 fixed point, sign-extended).
    pub x: i32,
    pub y: i32,
    /// Reference point for the current line; advanced by PB/PD per line.
    pub internal_x: i32,
    pub internal_y: i32,
}

impl AffineParams {
    fn identity() -> Self {
        Self {
            pa: 0x100,
            pd: 0x100,
            ..Self::default()
        }
    }

    pub fn reload(&mut self) {
        self.internal_x = self.x;
        self.internal_y = self.y;
    }

    pub fn advance_line(&mut self) {
        self.internal_x = self.internal_x.wrapping_add(self.pb as i32);
        self.internal_y = self.internal_y.wrapping_add(self.pd as i32);
    }
}

#[inline]
fn sign_extend_28(value: u32) -> i32 {
    ((value << 4) as i32) >> 4
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Video {
    pub vram: Box<[u8]>,
    pub palette: Box<[u8]>,
    pub oam: Box<[u8]>,

    pub dispcnt: u16,
    pub green_swap: u16,
    pub dispstat: u16,
    pub vcount: u16,
    pub bgcnt: [u16; 4],
    pub bg_hofs: [u16; 4],
    pub bg_vofs: [u16; 4],
    /// BG2 and BG3 rotation/scaling.
    pub affine: [AffineParams; 2],
    pub win_h: [u16; 2],
    pub win_v: [u16; 2],
    pub winin: u16,
    pub winout: u16,
    pub mosaic: u16,
    pub bldcnt: u16,
    pub bldalpha: u16,
    pub bldy: u16,
}

impl Video {
    pub fn new() -> Self {
        Self {
            vram: vec![0; VRAM_SIZE].into_boxed_slice(),
            palette: vec![0; PALETTE_SIZE].into_boxed_slice(),
            oam: vec![0; OAM_SIZE].into_boxed_slice(),
            dispcnt: DISPCNT_FORCED_BLANK,
            green_swap: 0,
            dispstat: 0,
            vcount: 0,
            bgcnt: [0; 4],
            bg_hofs: [0; 4],
            bg_vofs: [0; 4],
            affine: [AffineParams::identity(); 2],
            win_h: [0; 2],
            win_v: [0; 2],
            winin: 0,
            winout: 0,
            mosaic: 0,
            bldcnt: 0,
            bldalpha: 0,
            bldy: 0,
        }
    }

    #[inline]
    pub fn mode(&self) -> u16 {
        self.dispcnt & DISPCNT_MODE
    }

    #[inline]
    pub fn bitmap_mode(&self) -> bool {
        self.mode() >= 3
    }

    /// Offset of the first OBJ byte in VRAM for the current mode.
    #[inline]
    pub fn obj_vram_base(&self) -> u32 {
        if self.bitmap_mode() {
            OBJ_VRAM_BITMAP
        } else {
            OBJ_VRAM_TILED
        }
    }

    /// Fold a 0x0600_0000-relative offset into the 96 KiB VRAM array.
    /// 0x1_8000-0x1_FFFF mirrors the OBJ area.
    #[inline]
    pub fn vram_index(offset: u32) -> usize {
        let offset = offset & 0x1_FFFF;
        if offset >= VRAM_SIZE as u32 {
            (offset - 0x8000) as usize
        } else {
            offset as usize
        }
    }

    #[inline]
    pub fn vram8(&self, offset: u32) -> u8 {
        self.vram.get(offset as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub fn vram16(&self, offset: u32) -> u16 {
        let i = (offset & !1) as usize;
        match self.vram.get(i..i + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    #[inline]
    pub fn oam16(&self, offset: u32) -> u16 {
        let i = (offset & 0x3FE) as usize;
        u16::from_le_bytes([self.oam[i], self.oam[i + 1]])
    }

    /// 15-bit BGR color at palette entry `index` (0-511; 256+ are OBJ).
    #[inline]
    pub fn palette_color(&self, index: usize) -> u16 {
        let i = (index & 0x1FF) * 2;
        u16::from_le_bytes([self.palette[i], self.palette[i + 1]]) & 0x7FFF
    }

    /// Register read by offset from 0x0400_0000. `None` for write-only or
    /// unused registers.
    pub fn read_reg(&self, offset: u32) -> Option<u16> {
        let value = match offset {
            0x000 => self.dispcnt,
            0x002 => self.green_swap,
            0x004 => self.dispstat,
            0x006 => self.vcount,
            0x008 | 0x00A | 0x00C | 0x00E => self.bgcnt[((offset - 0x008) / 2) as usize],
            0x048 => self.winin,
            0x04A => self.winout,
            0x050 => self.bldcnt,
            0x052 => self.bldalpha,
            _ => return None,
        };
        Some(value)
    }

    pub fn write_reg(&mut self, offset: u32, value: u16) {
        match offset {
            0x000 => self.dispcnt = value,
            0x002 => self.green_swap = value,
            0x004 => {
                self.dispstat = (self.dispstat & !DISPSTAT_WRITABLE) | (value & DISPSTAT_WRITABLE)
            }
            0x006 => {}
            0x008 | 0x00A => self.bgcnt[((offset - 0x008) / 2) as usize] = value & 0xDFFF,
            0x00C | 0x00E => self.bgcnt[((offset - 0x008) / 2) as usize] = value,
            0x010..=0x01E => {
                let bg = ((offset - 0x010) / 4) as usize;
                if offset & 2 == 0 {
                    self.bg_hofs[bg] = value & 0x01FF;
                } else {
                    self.bg_vofs[bg] = value & 0x01FF;
                }
            }
            0x020..=0x03E => self.write_affine(offset, value),
            0x040 | 0x042 => self.win_h[((offset - 0x040) / 2) as usize] = value,
            0x044 | 0x046 => self.win_v[((offset - 0x044) / 2) as usize] = value,
            0x048 => self.winin = value & 0x3F3F,
            0x04A => self.winout = value & 0x3F3F,
            0x04C => self.mosaic = value,
            0x050 => self.bldcnt = value & 0x3FFF,
            0x052 => self.bldalpha = value & 0x1F1F,
            0x054 => self.bldy = value & 0x001F,
            _ => {}
        }
    }

    fn write_affine(&mut self, offset: u32, value: u16) {
        let bg = ((offset - 0x020) / 0x10) as usize;
        let p = &mut self.affine[bg];
        match (offset - 0x020) % 0x10 {
            0x0 => p.pa = value as i16,
            0x2 => p.pb = value as i16,
            0x4 => p.pc = value as i16,
            0x6 => p.pd = value as i16,
            0x8 => {
                let raw = (p.x as u32 & 0xFFFF_0000) | value as u32;
                p.x = sign_extend_28(raw);
                p.internal_x = p.x;
            }
            0xA => {
                let raw = (p.x as u32 & 0x0000_FFFF) | ((value as u32) << 16);
                p.x = sign_extend_28(raw);
                p.internal_x = p.x;
            }
            0xC => {
                let raw = (p.y as u32 & 0xFFFF_0000) | value as u32;
                p.y = sign_extend_28(raw);
                p.internal_y = p.y;
            }
            _ => {
                let raw = (p.y as u32 & 0x0000_FFFF) | ((value as u32) << 16);
                p.y = sign_extend_28(raw);
                p.internal_y = p.y;
            }
        }
    }

    /// CPU/DMA byte write. Palette and BG VRAM duplicate the byte across the
    /// halfword; OBJ VRAM and OAM ignore 8-bit writes.
    pub fn write_palette8(&mut self, offset: u32, val: u8) {
        let i = (offset & 0x3FE) as usize;
        self.palette[i] = val;
        self.palette[i + 1] = val;
    }

    pub fn write_vram8(&mut self, offset: u32, val: u8) {
        let index = Self::vram_index(offset);
        if index as u32 >= self.obj_vram_base() {
            return;
        }
        let i = index & !1;
        self.vram[i] = val;
        self.vram[i + 1] = val;
    }
}

impl Default for Video {
    fn default() -> Self {
        Self::new()
    }
}
