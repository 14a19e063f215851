// CPSR bits (ARM7TDMI data sheet, "Program Status Registers").
pub const PSR_N: u32 = 1 << 31;
pub const PSR_Z: u32 = 1 << 30;
pub const PSR_C: u32 = 1 << 29;
pub const PSR_V: u32 = 1 << 28;
pub const PSR_I: u32 = 1 << 7;
pub const PSR_F: u32 = 1 << 6;
pub const PSR_T: u32 = 1 << 5;
pub const PSR_MODE: u32 = 0x1F;
pub const PSR_FLAGS: u32 = PSR_N | PSR_Z | PSR_C | PSR_V;

pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    User,
    Fiq,
    Irq,
    Supervisor,
    Abort,
    Undefined,
    System,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & PSR_MODE {
            0x10 => Mode::User,
            0x11 => Mode::Fiq,
            0x12 => Mode::Irq,
            0x13 => Mode::Supervisor,
            0x17 => Mode::Abort,
            0x1B => Mode::Undefined,
            0x1F => Mode::System,
            _ => return None,
        })
    }

    pub const fn bits(self) -> u32 {
        match self {
            Mode::User => 0x10,
            Mode::Fiq => 0x11,
            Mode::Irq => 0x12,
            Mode::Supervisor => 0x13,
            Mode::Abort => 0x17,
            Mode::Undefined => 0x1B,
            Mode::System => 0x1F,
        }
    }

    /// Index into the r13/r14/SPSR banks. User and System share bank 0.
    pub const fn bank(self) -> usize {
        match self {
            Mode::User | Mode::System => 0,
            Mode::Fiq => 1,
            Mode::Irq => 2,
            Mode::Supervisor => 3,
            Mode::Abort => 4,
            Mode::Undefined => 5,
        }
    }

    pub const fn has_spsr(self) -> bool {
        !matches!(self, Mode::User | Mode::System)
    }
}

pub const BANK_COUNT: usize = 6;

/// Visible registers plus the inactive banks. Mode changes go through
/// [`RegisterFile::switch_mode`] so the visible set always belongs to the
/// mode in CPSR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    pub r: [u32; 16],
    pub cpsr: u32,
    /// r13/r14 per bank, valid for every bank except the active one.
    pub banked_sp_lr: [[u32; 2]; BANK_COUNT],
    /// r8-r12: `[0]` for every non-FIQ mode, `[1]` for FIQ.
    pub banked_r8_r12: [[u32; 5]; 2],
    /// SPSR per bank; entry 0 (User/System) is unused.
    pub spsr: [u32; BANK_COUNT],
}

impl RegisterFile {
    pub fn new(mode: Mode) -> Self {
        Self {
            r: [0; 16],
            cpsr: mode.bits() | PSR_I | PSR_F,
            banked_sp_lr: [[0; 2]; BANK_COUNT],
            banked_r8_r12: [[0; 5]; 2],
            spsr: [0; BANK_COUNT],
        }
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        // CPSR only ever holds valid mode bits; see `set_cpsr`.
        Mode::from_bits(self.cpsr).unwrap_or(Mode::System)
    }

    #[inline]
    pub fn thumb(&self) -> bool {
        self.cpsr & PSR_T != 0
    }

    #[inline]
    pub fn set_thumb(&mut self, on: bool) {
        self.set_flag(PSR_T, on);
    }

    #[inline]
    pub fn flag(&self, bit: u32) -> bool {
        self.cpsr & bit != 0
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.cpsr |= bit;
        } else {
            self.cpsr &= !bit;
        }
    }

    #[inline]
    pub fn set_nz(&mut self, result: u32) {
        self.set_flag(PSR_N, result & 0x8000_0000 != 0);
        self.set_flag(PSR_Z, result == 0);
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.r[PC]
    }

    /// Swap the visible r8-r14 for `new`'s bank. CPSR mode bits are
    /// updated to match.
    pub fn switch_mode(&mut self, new: Mode) {
        let old = self.mode();
        if old != new {
            let (ob, nb) = (old.bank(), new.bank());
            if ob != nb {
                self.banked_sp_lr[ob] = [self.r[SP], self.r[LR]];
                [self.r[SP], self.r[LR]] = self.banked_sp_lr[nb];
            }
            let (of, nf) = ((old == Mode::Fiq) as usize, (new == Mode::Fiq) as usize);
            if of != nf {
                self.banked_r8_r12[of].copy_from_slice(&self.r[8..13]);
                self.r[8..13].copy_from_slice(&self.banked_r8_r12[nf]);
            }
        }
        self.cpsr = (self.cpsr & !PSR_MODE) | new.bits();
    }

    /// Full CPSR write. Invalid mode bits leave the mode unchanged.
    pub fn set_cpsr(&mut self, value: u32) {
        match Mode::from_bits(value) {
            Some(mode) => {
                self.switch_mode(mode);
                self.cpsr = value;
            }
            None => {
                log::debug!("ignoring invalid mode bits {:02X}", value & PSR_MODE);
                self.cpsr = (value & !PSR_MODE) | (self.cpsr & PSR_MODE);
            }
        }
    }

    /// SPSR of the current mode; `None` in User/System.
    #[inline]
    pub fn spsr(&self) -> Option<u32> {
        let mode = self.mode();
        mode.has_spsr().then(|| self.spsr[mode.bank()])
    }

    pub fn set_spsr(&mut self, value: u32) {
        let mode = self.mode();
        if mode.has_spsr() {
            self.spsr[mode.bank()] = value;
        }
    }

    /// User-bank view of register `i`, for LDM/STM with the S bit.
    pub fn user_reg(&self, i: usize) -> u32 {
        let mode = self.mode();
        match i {
            8..=12 if mode == Mode::Fiq => self.banked_r8_r12[0][i - 8],
            13 | 14 if mode.bank() != 0 => self.banked_sp_lr[0][i - 13],
            _ => self.r[i],
        }
    }

    pub fn set_user_reg(&mut self, i: usize, value: u32) {
        let mode = self.mode();
        match i {
            8..=12 if mode == Mode::Fiq => self.banked_r8_r12[0][i - 8] = value,
            13 | 14 if mode.bank() != 0 => self.banked_sp_lr[0][i - 13] = value,
            _ => self.r[i] = value,
        }
    }

    /// Stack pointer of `mode` regardless of the active mode.
    pub fn set_banked_sp(&mut self, mode: Mode, value: u32) {
        if mode.bank() == self.mode().bank() {
            self.r[SP] = value;
        } else {
            self.banked_sp_lr[mode.bank()][0] = value;
        }
    }

    pub fn banked_sp(&self, mode: Mode) -> u32 {
        if mode.bank() == self.mode().bank() {
            self.r[SP]
        } else {
            self.banked_sp_lr[mode.bank()][0]
        }
    }
}
