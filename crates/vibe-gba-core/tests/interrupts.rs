mod common;

use common::*;
use vibe_gba_core::bus::Width;
use vibe_gba_core::cpu::hle::BIOS_IRQ_FLAGS;
use vibe_gba_core::cpu::registers::{Mode, PC, PSR_I};
use vibe_gba_core::interrupt::Interrupt;
use vibe_gba_core::Button;

const ENABLE_VBLANK_IRQ: [u32; 4] = [
    0xE3A0_3008, // mov r3, #8
    0xE1C2_30B4, // strh r3, [r2, #4]    DISPSTAT
    0xE3A0_3001, // mov r3, #1
    0xE1C4_30B0, // strh r3, [r4]        IE
];

fn with_tail(setup: &[u32], rest: &[u32]) -> Vec<u32> {
    setup.iter().chain(rest).copied().collect()
}

#[test]
fn vblank_irq_goes_through_bios_dispatcher() {
    let program = irq_rom(&with_tail(&ENABLE_VBLANK_IRQ, &[ARM_SPIN]));
    let spin = program.tail_addr + 16;
    let mut gba = machine_with(program.rom);
    run_frames(&mut gba, 3);

    assert_eq!(counter(&gba), 2);
    assert_eq!(gba.cpu.regs.r[PC], spin);
    assert_eq!(gba.cpu.regs.mode(), Mode::System);
    assert!(!gba.cpu.regs.flag(PSR_I));
    assert_eq!(
        gba.bus.peek(BIOS_IRQ_FLAGS, Width::Half) as u16,
        Interrupt::VBlank.mask()
    );
}

#[test]
fn masked_sources_are_not_delivered() {
    let program = irq_rom(&[ARM_SPIN]);
    let mut gba = machine_with(program.rom);
    gba.bus.write(REG_DISPSTAT, Width::Half, 0x0008);
    run_frames(&mut gba, 3);
    assert_eq!(counter(&gba), 0);
    assert_ne!(gba.bus.irq.flags & Interrupt::VBlank.mask(), 0);
}

#[test]
fn timer_overflow_raises_irq() {
    let program = irq_rom(&[ARM_SPIN]);
    let mut gba = machine_with(program.rom);
    gba.bus.write(REG_TM0CNT_L, Width::Half, 0xF000);
    gba.bus.write(REG_TM0CNT_H, Width::Half, 0x00C0);
    gba.bus.write(REG_IE, Width::Half, Interrupt::Timer0.mask() as u32);

    run_frames(&mut gba, 2);
    // One overflow every 0x1000 cycles.
    let expected = gba.bus.cycles / 0x1000;
    let count = counter(&gba) as u64;
    assert!(
        count + 2 >= expected && count <= expected,
        "{count} IRQs for {expected} overflows"
    );
}

#[test]
fn keypad_irq_fires_on_press() {
    let program = irq_rom(&[ARM_SPIN]);
    let mut gba = machine_with(program.rom);
    gba.bus.write(0x0400_0132, Width::Half, 0x4001);
    gba.bus.write(REG_IE, Width::Half, Interrupt::Keypad.mask() as u32);
    run_frames(&mut gba, 1);
    assert_eq!(counter(&gba), 0);

    let sender = gba.input_sender();
    assert!(sender.press(Button::A));
    run_frames(&mut gba, 1);
    assert_eq!(counter(&gba), 1);
}

#[test]
fn halt_sleeps_until_vblank() {
    let program = irq_rom(&[]);
    let swi = program.tail_addr + 16;
    let code = with_tail(
        &ENABLE_VBLANK_IRQ,
        &[
            0xEF02_0000, // swi 0x02 (Halt)
            arm_branch(swi + 4, swi),
        ],
    );
    let mut gba = machine_with(irq_rom(&code).rom);
    run_frames(&mut gba, 3);

    assert_eq!(counter(&gba), 2);
    assert!(gba.cpu.halted);
    assert_eq!(gba.cpu.regs.r[PC], swi + 4);
}

#[test]
fn vblank_intr_wait_returns_once_per_frame() {
    let program = irq_rom(&[]);
    let swi = program.tail_addr + 16;
    let code = with_tail(
        &ENABLE_VBLANK_IRQ,
        &[
            0xEF05_0000, // swi 0x05 (VBlankIntrWait)
            0xE285_5001, // add r5, r5, #1
            arm_branch(swi + 8, swi),
        ],
    );
    let mut gba = machine_with(irq_rom(&code).rom);
    run_frames(&mut gba, 3);

    assert_eq!(gba.cpu.regs.r[5], 2);
    assert_eq!(counter(&gba), 2);
    assert!(gba.cpu.halted);
}

#[test]
fn vblank_dma_runs_at_line_160() {
    let mut gba = machine_with(arm_rom(&[ARM_SPIN]));
    for i in 0..4u32 {
        gba.bus.write(0x0300_0100 + i * 4, Width::Word, 0x1111_1111 * (i + 1));
    }
    gba.bus.write(REG_DMA1SAD, Width::Word, 0x0300_0100);
    gba.bus.write(REG_DMA1DAD, Width::Word, 0x0200_0000);
    gba.bus.write(REG_DMA1CNT_L, Width::Half, 4);
    // Enable, IRQ on end, VBlank start, 32-bit units.
    gba.bus.write(REG_DMA1CNT_H, Width::Half, 0xD400);
    assert_eq!(gba.bus.peek(0x0200_0000, Width::Word), 0);

    gba.run_frame().unwrap();
    for i in 0..4u32 {
        assert_eq!(
            gba.bus.peek(0x0200_0000 + i * 4, Width::Word),
            0x1111_1111 * (i + 1)
        );
    }
    assert_eq!(gba.bus.read(REG_DMA1CNT_H, Width::Half) & 0x8000, 0);
    assert_ne!(gba.bus.irq.flags & Interrupt::Dma1.mask(), 0);
}
