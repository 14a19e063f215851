//! 16-bit Thumb instruction set.

use super::alu::{ShiftKind, multiply_cycles, shift_imm, shift_reg};
use super::registers::{LR, PC, PSR_C, SP};
use super::{Cpu, CpuError};
use crate::bus::{Access, Bus, Width};

/// Thumb format, resolved once per fetch from opcode bits 15-6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThumbOp {
    ShiftImm,
    AddSub,
    MovCmpAddSubImm,
    Alu,
    HiRegBx,
    LoadPcRel,
    LoadStoreReg,
    LoadStoreSigned,
    LoadStoreImm,
    LoadStoreHalf,
    LoadStoreSp,
    LoadAddress,
    AddSp,
    PushPop,
    BlockTransfer,
    CondBranch,
    Swi,
    Branch,
    LongBranchHigh,
    LongBranchLow,
    Undefined,
}

const fn classify(index: usize) -> ThumbOp {
    let op = (index << 6) as u16;
    match op >> 13 {
        0b000 => {
            if (op >> 11) & 3 == 3 {
                ThumbOp::AddSub
            } else {
                ThumbOp::ShiftImm
            }
        }
        0b001 => ThumbOp::MovCmpAddSubImm,
        0b010 => {
            if op & 0xFC00 == 0x4000 {
                ThumbOp::Alu
            } else if op & 0xFC00 == 0x4400 {
                ThumbOp::HiRegBx
            } else if op & 0xF800 == 0x4800 {
                ThumbOp::LoadPcRel
            } else if op & 0x0200 == 0 {
                ThumbOp::LoadStoreReg
            } else {
                ThumbOp::LoadStoreSigned
            }
        }
        0b011 => ThumbOp::LoadStoreImm,
        0b100 => {
            if op & 0x1000 == 0 {
                ThumbOp::LoadStoreHalf
            } else {
                ThumbOp::LoadStoreSp
            }
        }
        0b101 => {
            if op & 0x1000 == 0 {
                ThumbOp::LoadAddress
            } else if op & 0x0F00 == 0 {
                ThumbOp::AddSp
            } else if op & 0x0600 == 0x0400 {
                ThumbOp::PushPop
            } else {
                ThumbOp::Undefined
            }
        }
        0b110 => {
            if op & 0x1000 == 0 {
                ThumbOp::BlockTransfer
            } else {
                match (op >> 8) & 0xF {
                    0xF => ThumbOp::Swi,
                    0xE => ThumbOp::Undefined,
                    _ => ThumbOp::CondBranch,
                }
            }
        }
        _ => match (op >> 11) & 3 {
            0 => ThumbOp::Branch,
            1 => ThumbOp::Undefined,
            2 => ThumbOp::LongBranchHigh,
            _ => ThumbOp::LongBranchLow,
        },
    }
}

const fn build_table() -> [ThumbOp; 1024] {
    let mut table = [ThumbOp::Undefined; 1024];
    let mut i = 0;
    while i < 1024 {
        table[i] = classify(i);
        i += 1;
    }
    table
}

static THUMB_TABLE: [ThumbOp; 1024] = build_table();

#[inline]
pub fn decode(opcode: u16) -> ThumbOp {
    THUMB_TABLE[(opcode >> 6) as usize]
}

#[inline]
fn low_reg(op: u16, shift: u16) -> usize {
    ((op >> shift) & 7) as usize
}

/// Sign-extended 11-bit branch field.
#[inline]
fn offset11(op: u16) -> i32 {
    (((op as u32 & 0x7FF) << 21) as i32) >> 21
}

impl Cpu {
    pub(super) fn execute_thumb(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<(), CpuError> {
        match decode(op) {
            ThumbOp::ShiftImm => {
                let kind = ShiftKind::from_bits((op >> 11) as u32);
                let amount = ((op >> 6) & 0x1F) as u32;
                let value = self.regs.r[low_reg(op, 3)];
                let (result, carry) = shift_imm(kind, value, amount, self.regs.flag(PSR_C));
                self.regs.r[low_reg(op, 0)] = result;
                self.regs.set_nz(result);
                self.regs.set_flag(PSR_C, carry);
            }
            ThumbOp::AddSub => {
                let a = self.regs.r[low_reg(op, 3)];
                let field = ((op >> 6) & 7) as u32;
                let b = if op & 0x0400 != 0 { field } else { self.regs.r[field as usize] };
                let result = if op & 0x0200 != 0 {
                    self.alu_sub(a, b, true, true)
                } else {
                    self.alu_add(a, b, false, true)
                };
                self.regs.r[low_reg(op, 0)] = result;
            }
            ThumbOp::MovCmpAddSubImm => {
                let rd = low_reg(op, 8);
                let imm = (op & 0xFF) as u32;
                let a = self.regs.r[rd];
                match (op >> 11) & 3 {
                    0 => {
                        self.regs.r[rd] = imm;
                        self.regs.set_nz(imm);
                    }
                    1 => {
                        self.alu_sub(a, imm, true, true);
                    }
                    2 => self.regs.r[rd] = self.alu_add(a, imm, false, true),
                    _ => self.regs.r[rd] = self.alu_sub(a, imm, true, true),
                }
            }
            ThumbOp::Alu => self.thumb_alu(bus, op),
            ThumbOp::HiRegBx => self.thumb_hi_reg(op),
            ThumbOp::LoadPcRel => {
                let addr = (self.regs.r[PC] & !2).wrapping_add((op as u32 & 0xFF) * 4);
                let value = self.load(bus, addr, Width::Word, Access::NonSeq);
                bus.idle(1);
                self.regs.r[low_reg(op, 8)] = value;
            }
            ThumbOp::LoadStoreReg => {
                let addr = self.regs.r[low_reg(op, 3)].wrapping_add(self.regs.r[low_reg(op, 6)]);
                let width = if op & 0x0400 != 0 { Width::Byte } else { Width::Word };
                self.thumb_transfer(bus, op & 0x0800 != 0, width, addr, low_reg(op, 0));
            }
            ThumbOp::LoadStoreSigned => {
                let addr = self.regs.r[low_reg(op, 3)].wrapping_add(self.regs.r[low_reg(op, 6)]);
                let rd = low_reg(op, 0);
                match (op >> 10) & 3 {
                    0 => self.thumb_transfer(bus, false, Width::Half, addr, rd),
                    1 => self.thumb_transfer(bus, true, Width::Half, addr, rd),
                    2 => {
                        self.regs.r[rd] = self.load_signed_byte(bus, addr);
                        bus.idle(1);
                    }
                    _ => {
                        self.regs.r[rd] = self.load_signed_half(bus, addr);
                        bus.idle(1);
                    }
                }
            }
            ThumbOp::LoadStoreImm => {
                let byte = op & 0x1000 != 0;
                let offset = ((op >> 6) & 0x1F) as u32;
                let (width, offset) = if byte { (Width::Byte, offset) } else { (Width::Word, offset * 4) };
                let addr = self.regs.r[low_reg(op, 3)].wrapping_add(offset);
                self.thumb_transfer(bus, op & 0x0800 != 0, width, addr, low_reg(op, 0));
            }
            ThumbOp::LoadStoreHalf => {
                let offset = ((op >> 6) & 0x1F) as u32 * 2;
                let addr = self.regs.r[low_reg(op, 3)].wrapping_add(offset);
                self.thumb_transfer(bus, op & 0x0800 != 0, Width::Half, addr, low_reg(op, 0));
            }
            ThumbOp::LoadStoreSp => {
                let addr = self.regs.r[SP].wrapping_add((op as u32 & 0xFF) * 4);
                self.thumb_transfer(bus, op & 0x0800 != 0, Width::Word, addr, low_reg(op, 8));
            }
            ThumbOp::LoadAddress => {
                let base = if op & 0x0800 != 0 {
                    self.regs.r[SP]
                } else {
                    self.regs.r[PC] & !2
                };
                self.regs.r[low_reg(op, 8)] = base.wrapping_add((op as u32 & 0xFF) * 4);
            }
            ThumbOp::AddSp => {
                let offset = (op as u32 & 0x7F) * 4;
                self.regs.r[SP] = if op & 0x80 != 0 {
                    self.regs.r[SP].wrapping_sub(offset)
                } else {
                    self.regs.r[SP].wrapping_add(offset)
                };
            }
            ThumbOp::PushPop => self.thumb_push_pop(bus, op),
            ThumbOp::BlockTransfer => self.thumb_block(bus, op),
            ThumbOp::CondBranch => {
                if self.condition_passed((op >> 8) as u32) {
                    let offset = ((op as u8 as i8) as i32) << 1;
                    self.write_pc(pc.wrapping_add(4).wrapping_add(offset as u32));
                }
            }
            ThumbOp::Swi => self.software_interrupt(bus, (op & 0xFF) as u32, pc.wrapping_add(2)),
            ThumbOp::Branch => {
                let offset = offset11(op) << 1;
                self.write_pc(pc.wrapping_add(4).wrapping_add(offset as u32));
            }
            ThumbOp::LongBranchHigh => {
                let offset = offset11(op) << 12;
                self.regs.r[LR] = pc.wrapping_add(4).wrapping_add(offset as u32);
            }
            ThumbOp::LongBranchLow => {
                let target = self.regs.r[LR].wrapping_add((op as u32 & 0x7FF) << 1);
                self.regs.r[LR] = pc.wrapping_add(2) | 1;
                self.write_pc(target);
            }
            ThumbOp::Undefined => return Err(self.illegal(pc, op as u32)),
        }
        Ok(())
    }

    fn thumb_transfer(&mut self, bus: &mut Bus, load: bool, width: Width, addr: u32, rd: usize) {
        if load {
            let value = self.load(bus, addr, width, Access::NonSeq);
            bus.idle(1);
            self.regs.r[rd] = value;
        } else {
            let value = self.regs.r[rd];
            self.store(bus, addr, width, value, Access::NonSeq);
        }
    }

    fn thumb_alu(&mut self, bus: &mut Bus, op: u16) {
        let rd = low_reg(op, 0);
        let a = self.regs.r[rd];
        let b = self.regs.r[low_reg(op, 3)];
        let carry = self.regs.flag(PSR_C);
        let shift = |cpu: &mut Cpu, bus: &mut Bus, kind: ShiftKind| {
            bus.idle(1);
            let (result, c) = shift_reg(kind, a, b & 0xFF, carry);
            cpu.regs.set_nz(result);
            cpu.regs.set_flag(PSR_C, c);
            Some(result)
        };
        let result = match (op >> 6) & 0xF {
            0x0 => self.data_op(0x0, a, b, carry, true),
            0x1 => self.data_op(0x1, a, b, carry, true),
            0x2 => shift(self, bus, ShiftKind::Lsl),
            0x3 => shift(self, bus, ShiftKind::Lsr),
            0x4 => shift(self, bus, ShiftKind::Asr),
            0x5 => self.data_op(0x5, a, b, carry, true),
            0x6 => self.data_op(0x6, a, b, carry, true),
            0x7 => shift(self, bus, ShiftKind::Ror),
            0x8 => self.data_op(0x8, a, b, carry, true),
            0x9 => Some(self.alu_sub(0, b, true, true)),
            0xA => self.data_op(0xA, a, b, carry, true),
            0xB => self.data_op(0xB, a, b, carry, true),
            0xC => self.data_op(0xC, a, b, carry, true),
            0xD => {
                bus.idle(multiply_cycles(a, true));
                let product = a.wrapping_mul(b);
                self.regs.set_nz(product);
                Some(product)
            }
            0xE => self.data_op(0xE, a, b, carry, true),
            _ => self.data_op(0xF, a, b, carry, true),
        };
        if let Some(value) = result {
            self.regs.r[rd] = value;
        }
    }

    fn thumb_hi_reg(&mut self, op: u16) {
        let rd = (((op >> 4) & 8) | (op & 7)) as usize;
        let rs = ((op >> 3) & 0xF) as usize;
        let value = self.regs.r[rs];
        match (op >> 8) & 3 {
            0 => {
                let sum = self.regs.r[rd].wrapping_add(value);
                self.set_reg(rd, sum);
            }
            1 => {
                self.alu_sub(self.regs.r[rd], value, true, true);
            }
            2 => self.set_reg(rd, value),
            _ => self.branch_exchange(value),
        }
    }

    fn thumb_push_pop(&mut self, bus: &mut Bus, op: u16) {
        let list = (op & 0xFF) as u32;
        let extra = op & 0x0100 != 0;
        let count = list.count_ones() + extra as u32;
        let mut access = Access::NonSeq;

        if op & 0x0800 == 0 {
            let start = self.regs.r[SP].wrapping_sub(count * 4);
            let mut addr = start;
            for i in (0..8).filter(|i| list & (1 << i) != 0) {
                let value = self.regs.r[i];
                self.store(bus, addr, Width::Word, value, access);
                addr = addr.wrapping_add(4);
                access = Access::Seq;
            }
            if extra {
                let value = self.regs.r[LR];
                self.store(bus, addr, Width::Word, value, access);
            }
            self.regs.r[SP] = start;
        } else {
            let mut addr = self.regs.r[SP];
            for i in (0..8).filter(|i| list & (1 << i) != 0) {
                self.regs.r[i] = self.load(bus, addr, Width::Word, access);
                addr = addr.wrapping_add(4);
                access = Access::Seq;
            }
            let mut target = None;
            if extra {
                target = Some(self.load(bus, addr, Width::Word, access));
                addr = addr.wrapping_add(4);
            }
            bus.idle(1);
            self.regs.r[SP] = addr;
            if let Some(target) = target {
                self.write_pc(target);
            }
        }
    }

    fn thumb_block(&mut self, bus: &mut Bus, op: u16) {
        let rb = low_reg(op, 8);
        let base = self.regs.r[rb];
        let load = op & 0x0800 != 0;

        // An empty list transfers r15 and moves the base by 16 words.
        if op & 0xFF == 0 {
            if load {
                let target = self.load(bus, base, Width::Word, Access::NonSeq);
                self.regs.r[rb] = base.wrapping_add(0x40);
                self.write_pc(target);
            } else {
                let value = self.regs.r[PC].wrapping_add(2);
                self.store(bus, base, Width::Word, value, Access::NonSeq);
                self.regs.r[rb] = base.wrapping_add(0x40);
            }
            return;
        }

        let list = (op & 0xFF) as u32;
        let new_base = base.wrapping_add(list.count_ones() * 4);
        let first = list.trailing_zeros() as usize;
        let mut addr = base;
        let mut access = Access::NonSeq;
        for i in (0..8).filter(|i| list & (1 << i) != 0) {
            if load {
                self.regs.r[i] = self.load(bus, addr & !3, Width::Word, access);
            } else {
                let value = if i == rb && i != first { new_base } else { self.regs.r[i] };
                self.store(bus, addr & !3, Width::Word, value, access);
            }
            addr = addr.wrapping_add(4);
            access = Access::Seq;
        }
        if load {
            bus.idle(1);
            if list & (1 << rb) == 0 {
                self.regs.r[rb] = new_base;
            }
        } else {
            self.regs.r[rb] = new_base;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::registers::{PSR_N, PSR_T, PSR_Z};
    use super::super::tests::thumb_harness;
    use super::*;

    fn run(code: &[u16], steps: usize) -> (Cpu, Bus) {
        let (mut cpu, mut bus) = thumb_harness(code);
        for _ in 0..steps {
            cpu.step(&mut bus).unwrap();
        }
        (cpu, bus)
    }

    #[test]
    fn decode_formats() {
        assert_eq!(decode(0x0088), ThumbOp::ShiftImm); // lsl r0, r1, #2
        assert_eq!(decode(0x1888), ThumbOp::AddSub);
        assert_eq!(decode(0x2005), ThumbOp::MovCmpAddSubImm);
        assert_eq!(decode(0x4348), ThumbOp::Alu); // mul r0, r1
        assert_eq!(decode(0x4770), ThumbOp::HiRegBx); // bx lr
        assert_eq!(decode(0x4801), ThumbOp::LoadPcRel);
        assert_eq!(decode(0x5888), ThumbOp::LoadStoreReg);
        assert_eq!(decode(0x5E88), ThumbOp::LoadStoreSigned);
        assert_eq!(decode(0x6848), ThumbOp::LoadStoreImm);
        assert_eq!(decode(0x8848), ThumbOp::LoadStoreHalf);
        assert_eq!(decode(0x9801), ThumbOp::LoadStoreSp);
        assert_eq!(decode(0xA801), ThumbOp::LoadAddress);
        assert_eq!(decode(0xB082), ThumbOp::AddSp);
        assert_eq!(decode(0xB5F0), ThumbOp::PushPop);
        assert_eq!(decode(0xBE00), ThumbOp::Undefined); // bkpt
        assert_eq!(decode(0xC803), ThumbOp::BlockTransfer);
        assert_eq!(decode(0xD0FE), ThumbOp::CondBranch);
        assert_eq!(decode(0xDF06), ThumbOp::Swi);
        assert_eq!(decode(0xDE00), ThumbOp::Undefined);
        assert_eq!(decode(0xE7FE), ThumbOp::Branch);
        assert_eq!(decode(0xE800), ThumbOp::Undefined); // blx suffix
        assert_eq!(decode(0xF000), ThumbOp::LongBranchHigh);
        assert_eq!(decode(0xF800), ThumbOp::LongBranchLow);
    }

    #[test]
    fn immediate_ops_set_flags() {
        // movs r0, #5 ; subs r0, #5
        let (cpu, _) = run(&[0x2005, 0x3805], 2);
        assert_eq!(cpu.regs.r[0], 0);
        assert!(cpu.regs.flag(PSR_Z));
        assert!(cpu.regs.flag(PSR_C));
    }

    #[test]
    fn alu_negate_and_multiply() {
        // movs r1, #3 ; negs r0, r1 ; muls r0, r1
        let (cpu, _) = run(&[0x2103, 0x4248, 0x4348], 3);
        assert_eq!(cpu.regs.r[0], (-9i32) as u32);
        assert!(cpu.regs.flag(PSR_N));
    }

    #[test]
    fn long_branch_with_link() {
        // bl +0x100 from 0x0300_0000
        let (cpu, _) = run(&[0xF000, 0xF87E], 2);
        assert_eq!(cpu.regs.pc(), 0x0300_0100);
        assert_eq!(cpu.regs.r[LR], 0x0300_0005);
    }

    #[test]
    fn conditional_branch_backwards() {
        // movs r0, #0 ; beq -4 (to itself)
        let (cpu, _) = run(&[0x2000, 0xD0FE], 2);
        assert_eq!(cpu.regs.pc(), 0x0300_0002);
    }

    #[test]
    fn push_pop_round_trip() {
        // movs r0, #7 ; push {r0, lr} ; movs r0, #0 ; pop {r0}
        let (cpu, _) = run(&[0x2007, 0xB501, 0x2000, 0xBC01], 4);
        assert_eq!(cpu.regs.r[0], 7);
        assert_eq!(cpu.regs.r[SP], super::super::BOOT_SP_SYS - 4);
    }

    #[test]
    fn pop_pc_stays_in_thumb() {
        // ldr r0, [pc, #4] ; push {r0} ; pop {pc}
        let (mut cpu, mut bus) = thumb_harness(&[0x4801, 0xB401, 0xBD00, 0x0000, 0x0101, 0x0300]);
        for _ in 0..3 {
            cpu.step(&mut bus).unwrap();
        }
        assert!(cpu.regs.flag(PSR_T));
        assert_eq!(cpu.regs.pc(), 0x0300_0100);
    }

    #[test]
    fn bx_to_arm() {
        // add r0, pc, #4 (word aligned target) ; bx r0
        let (cpu, _) = run(&[0xA001, 0x4700], 2);
        assert!(!cpu.regs.flag(PSR_T));
        assert_eq!(cpu.regs.pc(), 0x0300_0008);
    }

    #[test]
    fn stmia_ldmia_with_writeback() {
        // ldr r2, =0x03000100 ; movs r0, #1 ; movs r1, #2 ; stmia r2!, {r0, r1}
        let (mut cpu, mut bus) = thumb_harness(&[0x4A01, 0x2001, 0x2102, 0xC203, 0x0100, 0x0300]);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.r[2], 0x0300_0108);
        assert_eq!(bus.peek(0x0300_0104, Width::Word), 2);
    }
}
