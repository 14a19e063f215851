//! ARM7TDMI interpreter.
//!
//! `r15` holds the address of the next instruction between steps. While an
//! instruction executes it reads as that instruction's address + 8 (ARM) or
//! + 4 (Thumb), the value the hardware pipeline exposes.

#[cfg(feature = "cpu-trace")]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "vibe_gba_core::cpu", $($arg)*);
    };
}
#[cfg(not(feature = "cpu-trace"))]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {};
}

mod alu;
mod arm;
pub mod hle;
pub mod registers;
mod thumb;

use thiserror::Error;

use crate::bus::{Access, Bus, Width, region_of};
use crate::config::IllegalInstructionPolicy;
use registers::{LR, Mode, PC, PSR_C, PSR_F, PSR_I, PSR_N, PSR_V, PSR_Z, RegisterFile, SP};

pub use arm::ArmOp;
pub use thumb::ThumbOp;

pub const VECTOR_SWI: u32 = 0x08;
pub const VECTOR_IRQ: u32 = 0x18;

pub const CART_ENTRY: u32 = 0x0800_0000;

// Stack pointers the BIOS leaves behind on its way to the cartridge.
pub const BOOT_SP_SYS: u32 = 0x0300_7F00;
pub const BOOT_SP_IRQ: u32 = 0x0300_7FA0;
pub const BOOT_SP_SVC: u32 = 0x0300_7FE0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    #[error("illegal {} instruction {opcode:08X} at {address:08X}", instruction_set(.thumb))]
    IllegalInstruction { address: u32, opcode: u32, thumb: bool },
}

fn instruction_set(thumb: &bool) -> &'static str {
    if *thumb { "Thumb" } else { "ARM" }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cpu {
    pub regs: RegisterFile,
    pub halted: bool,
    policy: IllegalInstructionPolicy,
    pub(crate) fault: Option<CpuError>,
    /// Access kind for the next opcode fetch.
    pub(crate) next_fetch: Access,
    /// Set by any instruction that writes r15.
    branched: bool,
    /// Run SWIs natively instead of through the BIOS vector.
    pub(crate) hle_swi: bool,
    /// An emulated IntrWait is sleeping and will re-run its SWI on wake-up.
    pub(crate) intr_wait_resume: bool,
}

impl Cpu {
    pub fn new(policy: IllegalInstructionPolicy) -> Self {
        Self {
            regs: RegisterFile::new(Mode::Supervisor),
            halted: false,
            policy,
            fault: None,
            next_fetch: Access::NonSeq,
            branched: false,
            hle_swi: true,
            intr_wait_resume: false,
        }
    }

    /// State the BIOS leaves behind when it jumps to the cartridge.
    pub fn reset_to_cartridge(&mut self) {
        self.reset_common(true);
        let regs = &mut self.regs;
        regs.switch_mode(Mode::Irq);
        regs.r[SP] = BOOT_SP_IRQ;
        regs.switch_mode(Mode::Supervisor);
        regs.r[SP] = BOOT_SP_SVC;
        regs.switch_mode(Mode::System);
        regs.r[SP] = BOOT_SP_SYS;
        regs.cpsr = Mode::System.bits();
        regs.r[PC] = CART_ENTRY;
    }

    /// Power-on state for running a real BIOS image from address 0.
    pub fn reset_to_bios(&mut self) {
        self.reset_common(false);
        self.regs.r[PC] = 0;
    }

    fn reset_common(&mut self, hle_swi: bool) {
        self.regs = RegisterFile::new(Mode::Supervisor);
        self.halted = false;
        self.fault = None;
        self.next_fetch = Access::NonSeq;
        self.branched = false;
        self.hle_swi = hle_swi;
        self.intr_wait_resume = false;
    }

    pub fn fault(&self) -> Option<CpuError> {
        self.fault
    }

    pub fn hle_swi(&self) -> bool {
        self.hle_swi
    }

    #[inline]
    pub fn irq_masked(&self) -> bool {
        self.regs.flag(PSR_I)
    }

    /// Execute one instruction and return the cycles it took, bus waits
    /// included.
    pub fn step(&mut self, bus: &mut Bus) -> Result<u32, CpuError> {
        if let Some(err) = self.fault {
            return Err(err);
        }
        if self.halted {
            return Ok(0);
        }

        let start = bus.cycles;
        self.branched = false;
        let pc = self.regs.r[PC];
        let fetch = std::mem::replace(&mut self.next_fetch, Access::Seq);

        let outcome = if self.regs.thumb() {
            let opcode = bus.read_access(pc & !1, Width::Half, fetch) as u16;
            self.regs.r[PC] = pc.wrapping_add(4);
            cpu_trace!("{:08X}: {:04X}  {:?}", pc, opcode, thumb::decode(opcode));
            self.execute_thumb(bus, pc, opcode)
        } else {
            let opcode = bus.read_access(pc & !3, Width::Word, fetch);
            self.regs.r[PC] = pc.wrapping_add(8);
            cpu_trace!("{:08X}: {:08X}  {:?}", pc, opcode, arm::decode(opcode));
            if self.condition_passed(opcode >> 28) {
                self.execute_arm(bus, pc, opcode)
            } else {
                Ok(())
            }
        };

        if let Err(err) = outcome {
            self.regs.r[PC] = pc;
            match self.policy {
                IllegalInstructionPolicy::Strict => {
                    log::error!("{err}; CPU halted until reset");
                    self.fault = Some(err);
                    return Err(err);
                }
                IllegalInstructionPolicy::Compatible => {
                    log::warn!("{err}; treated as no-op");
                    self.branched = false;
                }
            }
        }

        if self.branched {
            self.refill(bus);
        } else {
            let size = if self.regs.thumb() { 2 } else { 4 };
            self.regs.r[PC] = pc.wrapping_add(size);
        }

        if bus.take_halt_request() {
            self.halted = true;
        }
        Ok((bus.cycles - start) as u32)
    }

    /// The pipeline refetch after a taken branch: the N fetch happens on
    /// the next step, the S fetch of the second slot is charged here.
    fn refill(&mut self, bus: &mut Bus) {
        let pc = self.regs.r[PC];
        let width = if self.regs.thumb() { Width::Half } else { Width::Word };
        let cost = bus.region(region_of(pc)).cycles(width, Access::Seq);
        bus.idle(cost);
        self.next_fetch = Access::NonSeq;
    }

    /// Branch to `target`, aligned for the current instruction set.
    #[inline]
    pub(crate) fn write_pc(&mut self, target: u32) {
        let mask = if self.regs.thumb() { !1 } else { !3 };
        self.regs.r[PC] = target & mask;
        self.branched = true;
    }

    /// BX semantics: bit 0 selects Thumb.
    pub(crate) fn branch_exchange(&mut self, target: u32) {
        self.regs.set_thumb(target & 1 != 0);
        self.write_pc(target);
    }

    /// Register write that treats r15 as a branch.
    #[inline]
    pub(crate) fn set_reg(&mut self, rd: usize, value: u32) {
        if rd == PC {
            self.write_pc(value);
        } else {
            self.regs.r[rd] = value;
        }
    }

    pub(crate) fn condition_passed(&self, cond: u32) -> bool {
        let r = &self.regs;
        let (n, z, c, v) = (r.flag(PSR_N), r.flag(PSR_Z), r.flag(PSR_C), r.flag(PSR_V));
        match cond & 0xF {
            0x0 => z,
            0x1 => !z,
            0x2 => c,
            0x3 => !c,
            0x4 => n,
            0x5 => !n,
            0x6 => v,
            0x7 => !v,
            0x8 => c && !z,
            0x9 => !c || z,
            0xA => n == v,
            0xB => n != v,
            0xC => !z && n == v,
            0xD => z || n != v,
            0xE => true,
            _ => false,
        }
    }

    // Data accesses. Every one leaves the next opcode fetch non-sequential.

    #[inline]
    pub(crate) fn load(&mut self, bus: &mut Bus, addr: u32, width: Width, access: Access) -> u32 {
        self.next_fetch = Access::NonSeq;
        bus.read_access(addr, width, access)
    }

    #[inline]
    pub(crate) fn store(&mut self, bus: &mut Bus, addr: u32, width: Width, value: u32, access: Access) {
        self.next_fetch = Access::NonSeq;
        bus.write_access(addr, width, value, access);
    }

    /// Hardware IRQ entry. The caller checks IME/IE/IF and CPSR.I.
    pub fn enter_irq(&mut self, bus: &mut Bus) {
        let ret = self.regs.r[PC];
        let cpsr = self.regs.cpsr;
        self.regs.switch_mode(Mode::Irq);
        self.regs.set_spsr(cpsr);
        self.regs.r[LR] = ret.wrapping_add(4);
        self.regs.set_thumb(false);
        self.regs.cpsr |= PSR_I;
        self.halted = false;
        self.write_pc(VECTOR_IRQ);
        self.refill(bus);
        cpu_trace!("IRQ entry, return to {:08X}", ret);
    }

    /// SWI: `ret` is the address of the instruction after the SWI.
    fn software_interrupt(&mut self, bus: &mut Bus, comment: u32, ret: u32) {
        if self.hle_swi {
            self.regs.r[PC] = ret;
            hle::call(self, bus, comment, ret);
            if !self.branched {
                self.write_pc(self.regs.r[PC]);
            }
            return;
        }
        let cpsr = self.regs.cpsr;
        self.regs.switch_mode(Mode::Supervisor);
        self.regs.set_spsr(cpsr);
        self.regs.r[LR] = ret;
        self.regs.set_thumb(false);
        self.regs.cpsr |= PSR_I;
        self.write_pc(VECTOR_SWI);
    }

    /// CPSR copy from SPSR on exception return (`movs pc, lr` and friends).
    pub(crate) fn restore_cpsr(&mut self) {
        if let Some(spsr) = self.regs.spsr() {
            self.regs.set_cpsr(spsr);
        }
    }

    pub(crate) fn illegal(&self, address: u32, opcode: u32) -> CpuError {
        CpuError::IllegalInstruction {
            address,
            opcode,
            thumb: self.regs.thumb(),
        }
    }

    pub fn fiq_masked(&self) -> bool {
        self.regs.flag(PSR_F)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    /// CPU in System mode executing `code` from the start of IWRAM.
    pub(crate) fn arm_harness(code: &[u32]) -> (Cpu, Bus) {
        let mut bus = Bus::new(&MachineConfig::default());
        for (i, word) in code.iter().enumerate() {
            bus.write(0x0300_0000 + i as u32 * 4, Width::Word, *word);
        }
        let mut cpu = Cpu::new(IllegalInstructionPolicy::Strict);
        cpu.reset_to_cartridge();
        cpu.regs.r[PC] = 0x0300_0000;
        (cpu, bus)
    }

    pub(crate) fn thumb_harness(code: &[u16]) -> (Cpu, Bus) {
        let (mut cpu, mut bus) = arm_harness(&[]);
        for (i, half) in code.iter().enumerate() {
            bus.write(0x0300_0000 + i as u32 * 2, Width::Half, *half as u32);
        }
        cpu.regs.set_thumb(true);
        (cpu, bus)
    }

    #[test]
    fn boot_state_without_bios() {
        let mut cpu = Cpu::new(IllegalInstructionPolicy::Strict);
        cpu.reset_to_cartridge();
        assert_eq!(cpu.regs.mode(), Mode::System);
        assert_eq!(cpu.regs.r[SP], BOOT_SP_SYS);
        assert_eq!(cpu.regs.banked_sp(Mode::Irq), BOOT_SP_IRQ);
        assert_eq!(cpu.regs.banked_sp(Mode::Supervisor), BOOT_SP_SVC);
        assert_eq!(cpu.regs.pc(), CART_ENTRY);
        assert!(!cpu.irq_masked());
    }

    #[test]
    fn strict_policy_latches_fault() {
        // Coprocessor data operation.
        let (mut cpu, mut bus) = arm_harness(&[0xEE00_0000]);
        let err = cpu.step(&mut bus).unwrap_err();
        assert_eq!(
            err,
            CpuError::IllegalInstruction {
                address: 0x0300_0000,
                opcode: 0xEE00_0000,
                thumb: false
            }
        );
        assert_eq!(cpu.step(&mut bus), Err(err));
        assert_eq!(cpu.regs.pc(), 0x0300_0000);
    }

    #[test]
    fn compatible_policy_skips_illegal_opcode() {
        let (mut cpu, mut bus) = arm_harness(&[0xEE00_0000, 0xE3A0_0005]);
        cpu.policy = IllegalInstructionPolicy::Compatible;
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.r[0], 5);
    }

    #[test]
    fn failed_condition_skips_instruction() {
        // movs r0, #0 ; movne r1, #1 ; moveq r2, #2
        let (mut cpu, mut bus) = arm_harness(&[0xE3B0_0000, 0x13A0_1001, 0x03A0_2002]);
        for _ in 0..3 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.r[1], 0);
        assert_eq!(cpu.regs.r[2], 2);
    }

    #[test]
    fn irq_entry_banks_state() {
        let (mut cpu, mut bus) = arm_harness(&[]);
        cpu.regs.set_thumb(true);
        cpu.regs.r[PC] = 0x0800_0102;
        let cpsr = cpu.regs.cpsr;
        cpu.enter_irq(&mut bus);
        assert_eq!(cpu.regs.mode(), Mode::Irq);
        assert_eq!(cpu.regs.spsr(), Some(cpsr));
        assert_eq!(cpu.regs.r[LR], 0x0800_0106);
        assert_eq!(cpu.regs.pc(), VECTOR_IRQ);
        assert!(cpu.irq_masked());
        assert!(!cpu.regs.thumb());
    }

    #[test]
    fn step_reports_bus_cycles() {
        // mov r0, #1 from IWRAM: one 1-cycle fetch.
        let (mut cpu, mut bus) = arm_harness(&[0xE3A0_0001]);
        assert_eq!(cpu.step(&mut bus), Ok(1));
    }
}
