//! 32-bit ARM instruction set.

use super::alu::{ShiftKind, multiply_cycles, shift_imm, shift_reg};
use super::registers::{LR, Mode, PC, PSR_C, PSR_FLAGS, PSR_N, PSR_Z};
use super::{Cpu, CpuError};
use crate::bus::{Access, Bus, Width};

/// Instruction class, resolved once per fetch from opcode bits 27-20 and
/// 7-4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmOp {
    DataImm,
    DataShiftImm,
    DataShiftReg,
    Mrs,
    MsrReg,
    MsrImm,
    Multiply,
    MultiplyLong,
    Swap,
    BranchExchange,
    HalfwordTransfer,
    SingleTransfer,
    BlockTransfer,
    Branch,
    Swi,
    Undefined,
}

const fn classify(index: usize) -> ArmOp {
    let hi = (index >> 4) as u32;
    let lo = (index & 0xF) as u32;
    // Opcode 10xx with S clear: the miscellaneous space inside data processing.
    let misc = hi & 0x19 == 0x10;
    match hi >> 5 {
        0b000 => {
            if lo == 0b1001 {
                if hi & 0xFC == 0x00 {
                    ArmOp::Multiply
                } else if hi & 0xF8 == 0x08 {
                    ArmOp::MultiplyLong
                } else if hi == 0x10 || hi == 0x14 {
                    ArmOp::Swap
                } else {
                    ArmOp::Undefined
                }
            } else if lo & 0b1001 == 0b1001 {
                // Stores with SH=10/11 are doubleword ops on later cores.
                let load = hi & 1 != 0;
                if !load && (lo >> 1) & 3 != 1 {
                    ArmOp::Undefined
                } else {
                    ArmOp::HalfwordTransfer
                }
            } else if misc {
                match (hi, lo) {
                    (0x10 | 0x14, 0) => ArmOp::Mrs,
                    (0x12 | 0x16, 0) => ArmOp::MsrReg,
                    (0x12, 1) => ArmOp::BranchExchange,
                    _ => ArmOp::Undefined,
                }
            } else if lo & 1 == 0 {
                ArmOp::DataShiftImm
            } else {
                ArmOp::DataShiftReg
            }
        }
        0b001 => {
            if misc {
                if hi == 0x32 || hi == 0x36 {
                    ArmOp::MsrImm
                } else {
                    ArmOp::Undefined
                }
            } else {
                ArmOp::DataImm
            }
        }
        0b010 => ArmOp::SingleTransfer,
        0b011 => {
            if lo & 1 != 0 {
                ArmOp::Undefined
            } else {
                ArmOp::SingleTransfer
            }
        }
        0b100 => ArmOp::BlockTransfer,
        0b101 => ArmOp::Branch,
        0b110 => ArmOp::Undefined,
        _ => {
            if hi & 0x10 != 0 {
                ArmOp::Swi
            } else {
                ArmOp::Undefined
            }
        }
    }
}

const fn build_table() -> [ArmOp; 4096] {
    let mut table = [ArmOp::Undefined; 4096];
    let mut i = 0;
    while i < 4096 {
        table[i] = classify(i);
        i += 1;
    }
    table
}

static ARM_TABLE: [ArmOp; 4096] = build_table();

#[inline]
pub fn decode(opcode: u32) -> ArmOp {
    ARM_TABLE[(((opcode >> 16) & 0xFF0) | ((opcode >> 4) & 0xF)) as usize]
}

#[inline]
fn bit(op: u32, n: u32) -> bool {
    op & (1 << n) != 0
}

#[inline]
fn reg(op: u32, shift: u32) -> usize {
    ((op >> shift) & 0xF) as usize
}

impl Cpu {
    pub(super) fn execute_arm(&mut self, bus: &mut Bus, pc: u32, op: u32) -> Result<(), CpuError> {
        match decode(op) {
            ArmOp::DataImm | ArmOp::DataShiftImm | ArmOp::DataShiftReg => self.arm_data(bus, op),
            ArmOp::Mrs => self.arm_mrs(op),
            ArmOp::MsrReg | ArmOp::MsrImm => self.arm_msr(op),
            ArmOp::Multiply => self.arm_multiply(bus, op),
            ArmOp::MultiplyLong => self.arm_multiply_long(bus, op),
            ArmOp::Swap => self.arm_swap(bus, op),
            ArmOp::BranchExchange => self.branch_exchange(self.regs.r[reg(op, 0)]),
            ArmOp::HalfwordTransfer => self.arm_halfword(bus, op),
            ArmOp::SingleTransfer => self.arm_single(bus, op),
            ArmOp::BlockTransfer => self.arm_block(bus, op),
            ArmOp::Branch => {
                let offset = (((op << 8) as i32) >> 6) as u32;
                if bit(op, 24) {
                    self.regs.r[LR] = pc.wrapping_add(4);
                }
                self.write_pc(pc.wrapping_add(8).wrapping_add(offset));
            }
            ArmOp::Swi => self.software_interrupt(bus, (op >> 16) & 0xFF, pc.wrapping_add(4)),
            ArmOp::Undefined => return Err(self.illegal(pc, op)),
        }
        Ok(())
    }

    /// Operand 2 of a data-processing instruction with the shifter carry.
    fn shifter_operand(&mut self, bus: &mut Bus, op: u32) -> (u32, bool) {
        let carry = self.regs.flag(PSR_C);
        if bit(op, 25) {
            let rot = ((op >> 8) & 0xF) * 2;
            let value = (op & 0xFF).rotate_right(rot);
            let c = if rot == 0 { carry } else { value >> 31 != 0 };
            return (value, c);
        }
        let rm = reg(op, 0);
        let kind = ShiftKind::from_bits(op >> 5);
        if bit(op, 4) {
            bus.idle(1);
            let amount = self.regs.r[reg(op, 8)] & 0xFF;
            // The extra cycle moves PC one more word ahead.
            let value = if rm == PC {
                self.regs.r[PC].wrapping_add(4)
            } else {
                self.regs.r[rm]
            };
            shift_reg(kind, value, amount, carry)
        } else {
            shift_imm(kind, self.regs.r[rm], (op >> 7) & 0x1F, carry)
        }
    }

    fn arm_data(&mut self, bus: &mut Bus, op: u32) {
        let opcode = (op >> 21) & 0xF;
        let s = bit(op, 20);
        let rn = reg(op, 16);
        let rd = reg(op, 12);
        let (operand, shifter_carry) = self.shifter_operand(bus, op);
        let a = if rn == PC && !bit(op, 25) && bit(op, 4) {
            self.regs.r[PC].wrapping_add(4)
        } else {
            self.regs.r[rn]
        };

        let result = self.data_op(opcode, a, operand, shifter_carry, s && rd != PC);
        if let Some(value) = result {
            if rd == PC {
                if s {
                    self.restore_cpsr();
                }
                self.write_pc(value);
            } else {
                self.regs.r[rd] = value;
            }
        }
    }

    fn arm_mrs(&mut self, op: u32) {
        let value = if bit(op, 22) {
            self.regs.spsr().unwrap_or(self.regs.cpsr)
        } else {
            self.regs.cpsr
        };
        self.regs.r[reg(op, 12)] = value;
    }

    fn arm_msr(&mut self, op: u32) {
        let value = if bit(op, 25) {
            (op & 0xFF).rotate_right(((op >> 8) & 0xF) * 2)
        } else {
            self.regs.r[reg(op, 0)]
        };
        let mut mask = 0u32;
        for (field, bits) in [(16, 0x0000_00FF), (17, 0x0000_FF00), (18, 0x00FF_0000), (19, 0xFF00_0000)] {
            if bit(op, field) {
                mask |= bits;
            }
        }
        if bit(op, 22) {
            if let Some(spsr) = self.regs.spsr() {
                self.regs.set_spsr((spsr & !mask) | (value & mask));
            }
        } else {
            if self.regs.mode() == Mode::User {
                mask &= PSR_FLAGS;
            }
            let cpsr = (self.regs.cpsr & !mask) | (value & mask);
            self.regs.set_cpsr(cpsr);
        }
    }

    fn arm_multiply(&mut self, bus: &mut Bus, op: u32) {
        let rd = reg(op, 16);
        let rs = self.regs.r[reg(op, 8)];
        let mut result = self.regs.r[reg(op, 0)].wrapping_mul(rs);
        let mut cycles = multiply_cycles(rs, true);
        if bit(op, 21) {
            result = result.wrapping_add(self.regs.r[reg(op, 12)]);
            cycles += 1;
        }
        bus.idle(cycles);
        self.regs.r[rd] = result;
        if bit(op, 20) {
            self.regs.set_nz(result);
        }
    }

    fn arm_multiply_long(&mut self, bus: &mut Bus, op: u32) {
        let rd_hi = reg(op, 16);
        let rd_lo = reg(op, 12);
        let rs = self.regs.r[reg(op, 8)];
        let rm = self.regs.r[reg(op, 0)];
        let signed = bit(op, 22);
        let mut result = if signed {
            (rm as i32 as i64).wrapping_mul(rs as i32 as i64) as u64
        } else {
            rm as u64 * rs as u64
        };
        let mut cycles = multiply_cycles(rs, signed) + 1;
        if bit(op, 21) {
            let acc = ((self.regs.r[rd_hi] as u64) << 32) | self.regs.r[rd_lo] as u64;
            result = result.wrapping_add(acc);
            cycles += 1;
        }
        bus.idle(cycles);
        self.regs.r[rd_lo] = result as u32;
        self.regs.r[rd_hi] = (result >> 32) as u32;
        if bit(op, 20) {
            self.regs.set_flag(PSR_N, result >> 63 != 0);
            self.regs.set_flag(PSR_Z, result == 0);
        }
    }

    fn arm_swap(&mut self, bus: &mut Bus, op: u32) {
        let width = if bit(op, 22) { Width::Byte } else { Width::Word };
        let addr = self.regs.r[reg(op, 16)];
        let source = self.regs.r[reg(op, 0)];
        let old = self.load(bus, addr, width, Access::NonSeq);
        self.store(bus, addr, width, source, Access::NonSeq);
        bus.idle(1);
        self.set_reg(reg(op, 12), old);
    }

    /// Address computation shared by the single and halfword transfers:
    /// returns (access address, written-back base).
    fn transfer_address(&self, op: u32, offset: u32) -> (u32, u32) {
        let base = self.regs.r[reg(op, 16)];
        let target = if bit(op, 23) {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if bit(op, 24) { target } else { base };
        (addr, target)
    }

    fn store_value(&self, rd: usize) -> u32 {
        if rd == PC {
            self.regs.r[PC].wrapping_add(4)
        } else {
            self.regs.r[rd]
        }
    }

    fn arm_single(&mut self, bus: &mut Bus, op: u32) {
        let offset = if bit(op, 25) {
            let carry = self.regs.flag(PSR_C);
            let kind = ShiftKind::from_bits(op >> 5);
            shift_imm(kind, self.regs.r[reg(op, 0)], (op >> 7) & 0x1F, carry).0
        } else {
            op & 0xFFF
        };
        let (addr, new_base) = self.transfer_address(op, offset);
        let writeback = !bit(op, 24) || bit(op, 21);
        let width = if bit(op, 22) { Width::Byte } else { Width::Word };
        let rn = reg(op, 16);
        let rd = reg(op, 12);

        if bit(op, 20) {
            let value = self.load(bus, addr, width, Access::NonSeq);
            bus.idle(1);
            if writeback {
                self.set_reg(rn, new_base);
            }
            self.set_reg(rd, value);
        } else {
            let value = self.store_value(rd);
            self.store(bus, addr, width, value, Access::NonSeq);
            if writeback {
                self.set_reg(rn, new_base);
            }
        }
    }

    fn arm_halfword(&mut self, bus: &mut Bus, op: u32) {
        let offset = if bit(op, 22) {
            ((op >> 4) & 0xF0) | (op & 0xF)
        } else {
            self.regs.r[reg(op, 0)]
        };
        let (addr, new_base) = self.transfer_address(op, offset);
        let writeback = !bit(op, 24) || bit(op, 21);
        let rn = reg(op, 16);
        let rd = reg(op, 12);

        if bit(op, 20) {
            let value = match (op >> 5) & 3 {
                1 => self.load(bus, addr, Width::Half, Access::NonSeq),
                2 => self.load_signed_byte(bus, addr),
                _ => self.load_signed_half(bus, addr),
            };
            bus.idle(1);
            if writeback {
                self.set_reg(rn, new_base);
            }
            self.set_reg(rd, value);
        } else {
            let value = self.store_value(rd);
            self.store(bus, addr, Width::Half, value, Access::NonSeq);
            if writeback {
                self.set_reg(rn, new_base);
            }
        }
    }

    pub(super) fn load_signed_byte(&mut self, bus: &mut Bus, addr: u32) -> u32 {
        self.load(bus, addr, Width::Byte, Access::NonSeq) as u8 as i8 as i32 as u32
    }

    /// LDRSH from an odd address sign-extends the addressed byte.
    pub(super) fn load_signed_half(&mut self, bus: &mut Bus, addr: u32) -> u32 {
        if addr & 1 != 0 {
            self.load_signed_byte(bus, addr)
        } else {
            self.load(bus, addr, Width::Half, Access::NonSeq) as u16 as i16 as i32 as u32
        }
    }

    fn arm_block(&mut self, bus: &mut Bus, op: u32) {
        let rn = reg(op, 16);
        let base = self.regs.r[rn];
        let up = bit(op, 23);
        let pre = bit(op, 24);
        let s = bit(op, 22);
        let writeback = bit(op, 21);
        let load = bit(op, 20);

        // An empty list transfers r15 and moves the base by 16 words.
        let (list, size) = match op & 0xFFFF {
            0 => (1u32 << PC, 0x40),
            list => (list, list.count_ones() * 4),
        };
        let (start, new_base) = match (up, pre) {
            (true, false) => (base, base.wrapping_add(size)),
            (true, true) => (base.wrapping_add(4), base.wrapping_add(size)),
            (false, false) => (base.wrapping_sub(size).wrapping_add(4), base.wrapping_sub(size)),
            (false, true) => (base.wrapping_sub(size), base.wrapping_sub(size)),
        };
        let has_pc = list & (1 << PC) != 0;
        let user_bank = s && !(load && has_pc);

        let mut addr = start;
        let mut access = Access::NonSeq;
        if load {
            if writeback {
                self.regs.r[rn] = new_base;
            }
            let mut new_pc = None;
            for i in (0..16).filter(|i| list & (1 << i) != 0) {
                let value = self.load(bus, addr & !3, Width::Word, access);
                if i == PC {
                    new_pc = Some(value);
                } else if user_bank {
                    self.regs.set_user_reg(i, value);
                } else {
                    self.regs.r[i] = value;
                }
                addr = addr.wrapping_add(4);
                access = Access::Seq;
            }
            bus.idle(1);
            if let Some(target) = new_pc {
                if s {
                    self.restore_cpsr();
                }
                self.write_pc(target);
            }
        } else {
            let first = list.trailing_zeros() as usize;
            for i in (0..16).filter(|i| list & (1 << i) != 0) {
                let value = if i == PC {
                    self.regs.r[PC].wrapping_add(4)
                } else if i == rn && i != first && writeback {
                    new_base
                } else if user_bank {
                    self.regs.user_reg(i)
                } else {
                    self.regs.r[i]
                };
                self.store(bus, addr & !3, Width::Word, value, access);
                addr = addr.wrapping_add(4);
                access = Access::Seq;
            }
            if writeback {
                self.regs.r[rn] = new_base;
            }
        }
    }
}
