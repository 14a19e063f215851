#![allow(dead_code)]

use vibe_gba_core::bus::Width;
use vibe_gba_core::{Machine, MachineConfig};

pub const ROM_BASE: u32 = 0x0800_0000;
pub const CODE_OFFSET: usize = 0xC0;

/// IWRAM word the test IRQ handler increments.
pub const COUNTER: u32 = 0x0300_0000;
/// Where [`irq_rom`] places its ARM interrupt handler.
pub const IRQ_HANDLER: u32 = ROM_BASE + 0xC4;

// I/O registers touched by the tests.
pub const REG_DISPCNT: u32 = 0x0400_0000;
pub const REG_DISPSTAT: u32 = 0x0400_0004;
pub const REG_DMA1SAD: u32 = 0x0400_00BC;
pub const REG_DMA1DAD: u32 = 0x0400_00C0;
pub const REG_DMA1CNT_L: u32 = 0x0400_00C4;
pub const REG_DMA1CNT_H: u32 = 0x0400_00C6;
pub const REG_DMA3SAD: u32 = 0x0400_00D4;
pub const REG_DMA3DAD: u32 = 0x0400_00D8;
pub const REG_DMA3CNT_L: u32 = 0x0400_00DC;
pub const REG_DMA3CNT_H: u32 = 0x0400_00DE;
pub const REG_TM0CNT_L: u32 = 0x0400_0100;
pub const REG_TM0CNT_H: u32 = 0x0400_0102;
pub const REG_IE: u32 = 0x0400_0200;
pub const REG_IF: u32 = 0x0400_0202;

pub const ARM_SPIN: u32 = 0xEAFF_FFFE; // b .

/// ARM `b` from the instruction at `from` to `to`.
pub fn arm_branch(from: u32, to: u32) -> u32 {
    0xEA00_0000 | ((to.wrapping_sub(from.wrapping_add(8)) >> 2) & 0x00FF_FFFF)
}

/// Zeroed image with a valid fixed header byte and the given title.
pub fn blank_rom(size: usize, title: &str) -> Vec<u8> {
    let mut rom = vec![0u8; size.max(0x200)];
    let title = title.as_bytes();
    let n = title.len().min(12);
    rom[0xA0..0xA0 + n].copy_from_slice(&title[..n]);
    rom[0xB2] = 0x96;
    rom
}

/// ROM whose entry point jumps to `code`, laid out at 0xC0.
pub fn arm_rom(code: &[u32]) -> Vec<u8> {
    let mut rom = blank_rom(0x400, "VIBETEST");
    put_words(&mut rom, 0, &[arm_branch(ROM_BASE, ROM_BASE + CODE_OFFSET as u32)]);
    put_words(&mut rom, CODE_OFFSET, code);
    rom
}

pub fn put_words(rom: &mut [u8], offset: usize, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        let at = offset + i * 4;
        rom[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
}

pub struct IrqRom {
    pub rom: Vec<u8>,
    /// Address of the first instruction of `tail`.
    pub tail_addr: u32,
}

/// A program that installs an ARM IRQ handler, enables IME and then runs
/// `tail`. The handler acknowledges IF, mirrors it into the BIOS flag word
/// at 0x03007FF8 and bumps [`COUNTER`].
///
/// On entry to `tail`: r2 = 0x04000000, r4 = 0x04000200.
pub fn irq_rom(tail: &[u32]) -> IrqRom {
    const HANDLER: [u32; 12] = [
        0xE280_2C02, // add r2, r0, #0x200
        0xE1D2_10B2, // ldrh r1, [r2, #2]
        0xE1C2_10B2, // strh r1, [r2, #2]
        0xE240_3008, // sub r3, r0, #8
        0xE1D3_C0B0, // ldrh r12, [r3]
        0xE18C_C001, // orr r12, r12, r1
        0xE1C3_C0B0, // strh r12, [r3]
        0xE3A0_3403, // mov r3, #0x03000000
        0xE593_1000, // ldr r1, [r3]
        0xE281_1001, // add r1, r1, #1
        0xE583_1000, // str r1, [r3]
        0xE12F_FF1E, // bx lr
    ];
    let main = IRQ_HANDLER + HANDLER.len() as u32 * 4;
    let sub_pc = main + 0x0C;
    let install = [
        0xE3A0_0403, // mov r0, #0x03000000
        0xE280_0C7F, // add r0, r0, #0x7F00
        0xE280_00FC, // add r0, r0, #0xFC
        0xE24F_1000 | (sub_pc + 8 - IRQ_HANDLER), // sub r1, pc, #n
        0xE580_1000, // str r1, [r0]
        0xE3A0_2301, // mov r2, #0x04000000
        0xE282_4C02, // add r4, r2, #0x200
        0xE3A0_3001, // mov r3, #1
        0xE1C4_30B8, // strh r3, [r4, #8]
    ];

    let mut code = vec![arm_branch(ROM_BASE + CODE_OFFSET as u32, main)];
    code.extend_from_slice(&HANDLER);
    code.extend_from_slice(&install);
    let tail_addr = main + install.len() as u32 * 4;
    code.extend_from_slice(tail);
    IrqRom {
        rom: arm_rom(&code),
        tail_addr,
    }
}

pub fn machine_with(rom: Vec<u8>) -> Machine {
    let mut gba = Machine::new(MachineConfig::default());
    gba.load_cartridge(rom).unwrap();
    gba
}

pub fn counter(gba: &Machine) -> u32 {
    gba.bus.peek(COUNTER, Width::Word)
}

pub fn run_frames(gba: &mut Machine, frames: usize) {
    for _ in 0..frames {
        gba.run_frame().unwrap();
    }
}
