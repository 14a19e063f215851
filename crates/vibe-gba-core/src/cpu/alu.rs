//! Barrel shifter, flag-setting arithmetic and multiply timing shared by
//! the ARM and Thumb executors.

use super::Cpu;
use super::registers::{PSR_C, PSR_V};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ShiftKind::Lsl,
            1 => ShiftKind::Lsr,
            2 => ShiftKind::Asr,
            _ => ShiftKind::Ror,
        }
    }
}

/// Shift by an immediate amount. Amount 0 encodes LSR #32, ASR #32 and RRX.
pub fn shift_imm(kind: ShiftKind, value: u32, amount: u32, carry_in: bool) -> (u32, bool) {
    match (kind, amount) {
        (ShiftKind::Lsl, 0) => (value, carry_in),
        (ShiftKind::Lsr | ShiftKind::Asr, 0) => shift_reg(kind, value, 32, carry_in),
        (ShiftKind::Ror, 0) => (
            ((carry_in as u32) << 31) | (value >> 1),
            value & 1 != 0,
        ),
        _ => shift_reg(kind, value, amount, carry_in),
    }
}

/// Shift by a register amount (bottom byte). Amount 0 leaves value and carry.
pub fn shift_reg(kind: ShiftKind, value: u32, amount: u32, carry_in: bool) -> (u32, bool) {
    if amount == 0 {
        return (value, carry_in);
    }
    match kind {
        ShiftKind::Lsl => match amount {
            1..=31 => (value << amount, (value >> (32 - amount)) & 1 != 0),
            32 => (0, value & 1 != 0),
            _ => (0, false),
        },
        ShiftKind::Lsr => match amount {
            1..=31 => (value >> amount, (value >> (amount - 1)) & 1 != 0),
            32 => (0, value >> 31 != 0),
            _ => (0, false),
        },
        ShiftKind::Asr => {
            if amount < 32 {
                (
                    ((value as i32) >> amount) as u32,
                    (value >> (amount - 1)) & 1 != 0,
                )
            } else {
                let sign = value >> 31 != 0;
                (if sign { u32::MAX } else { 0 }, sign)
            }
        }
        ShiftKind::Ror => {
            let rot = amount & 31;
            if rot == 0 {
                (value, value >> 31 != 0)
            } else {
                let r = value.rotate_right(rot);
                (r, r >> 31 != 0)
            }
        }
    }
}

/// Internal cycles taken by the multiplier for operand `rs`.
pub fn multiply_cycles(rs: u32, signed: bool) -> u32 {
    let top = |mask: u32| {
        let bits = rs & mask;
        bits == 0 || (signed && bits == mask)
    };
    if top(0xFFFF_FF00) {
        1
    } else if top(0xFFFF_0000) {
        2
    } else if top(0xFF00_0000) {
        3
    } else {
        4
    }
}

impl Cpu {
    pub(super) fn alu_add(&mut self, a: u32, b: u32, carry: bool, set_flags: bool) -> u32 {
        let wide = a as u64 + b as u64 + carry as u64;
        let result = wide as u32;
        if set_flags {
            self.regs.set_nz(result);
            self.regs.set_flag(PSR_C, wide > u32::MAX as u64);
            self.regs.set_flag(PSR_V, (!(a ^ b) & (a ^ result)) >> 31 != 0);
        }
        result
    }

    /// `a - b - !carry`; C is set when no borrow occurred.
    pub(super) fn alu_sub(&mut self, a: u32, b: u32, carry: bool, set_flags: bool) -> u32 {
        let borrow = !carry as u64;
        let result = a.wrapping_sub(b).wrapping_sub(borrow as u32);
        if set_flags {
            self.regs.set_nz(result);
            self.regs.set_flag(PSR_C, a as u64 >= b as u64 + borrow);
            self.regs.set_flag(PSR_V, ((a ^ b) & (a ^ result)) >> 31 != 0);
        }
        result
    }

    /// One of the 16 data-processing opcodes. Returns `None` for the
    /// compare/test group, which only updates flags.
    pub(super) fn data_op(
        &mut self,
        opcode: u32,
        a: u32,
        b: u32,
        shifter_carry: bool,
        set_flags: bool,
    ) -> Option<u32> {
        let c = self.regs.flag(PSR_C);
        let logical = |cpu: &mut Cpu, r: u32| {
            if set_flags {
                cpu.regs.set_nz(r);
                cpu.regs.set_flag(PSR_C, shifter_carry);
            }
            r
        };
        let result = match opcode & 0xF {
            0x0 => logical(self, a & b),
            0x1 => logical(self, a ^ b),
            0x2 => self.alu_sub(a, b, true, set_flags),
            0x3 => self.alu_sub(b, a, true, set_flags),
            0x4 => self.alu_add(a, b, false, set_flags),
            0x5 => self.alu_add(a, b, c, set_flags),
            0x6 => self.alu_sub(a, b, c, set_flags),
            0x7 => self.alu_sub(b, a, c, set_flags),
            0x8 => {
                logical(self, a & b);
                return None;
            }
            0x9 => {
                logical(self, a ^ b);
                return None;
            }
            0xA => {
                self.alu_sub(a, b, true, true);
                return None;
            }
            0xB => {
                self.alu_add(a, b, false, true);
                return None;
            }
            0xC => logical(self, a | b),
            0xD => logical(self, b),
            0xE => logical(self, a & !b),
            _ => logical(self, !b),
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_zero_shift_encodings() {
        assert_eq!(shift_imm(ShiftKind::Lsl, 0x8000_0001, 0, true), (0x8000_0001, true));
        assert_eq!(shift_imm(ShiftKind::Lsr, 0x8000_0000, 0, false), (0, true));
        assert_eq!(shift_imm(ShiftKind::Asr, 0x8000_0000, 0, false), (u32::MAX, true));
        assert_eq!(shift_imm(ShiftKind::Ror, 0x0000_0003, 0, true), (0x8000_0001, true));
    }

    #[test]
    fn register_shifts_past_32() {
        assert_eq!(shift_reg(ShiftKind::Lsl, 1, 32, false), (0, true));
        assert_eq!(shift_reg(ShiftKind::Lsl, 1, 33, true), (0, false));
        assert_eq!(shift_reg(ShiftKind::Lsr, 0x8000_0000, 32, false), (0, true));
        assert_eq!(shift_reg(ShiftKind::Ror, 0x8000_0000, 32, false), (0x8000_0000, true));
        assert_eq!(shift_reg(ShiftKind::Ror, 0x1234, 0, true), (0x1234, true));
    }

    #[test]
    fn multiplier_significance() {
        assert_eq!(multiply_cycles(0xFF, false), 1);
        assert_eq!(multiply_cycles(0xFFFF_FFF0, true), 1);
        assert_eq!(multiply_cycles(0xFFFF_FFF0, false), 4);
        assert_eq!(multiply_cycles(0x0001_0000, false), 3);
    }
}
