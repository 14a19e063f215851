mod common;

use common::*;
use vibe_gba_core::backup::{Backup, EepromState};
use vibe_gba_core::bus::Width;
use vibe_gba_core::state::STATE_VERSION;
use vibe_gba_core::{Machine, StateError};

const VBLANK_TAIL: [u32; 5] = [
    0xE3A0_3008, // mov r3, #8
    0xE1C2_30B4, // strh r3, [r2, #4]
    0xE3A0_3001, // mov r3, #1
    0xE1C4_30B0, // strh r3, [r4]
    ARM_SPIN,
];

/// Offset of the payload of section `tag`.
fn section(blob: &[u8], tag: &[u8; 4]) -> usize {
    let mut at = 6;
    while at + 8 <= blob.len() {
        let len = u32::from_le_bytes(blob[at + 4..at + 8].try_into().unwrap()) as usize;
        if &blob[at..at + 4] == tag {
            return at + 8;
        }
        at += 8 + len;
    }
    panic!("no {:?} section", String::from_utf8_lossy(tag));
}

fn put_u32(blob: &mut [u8], at: usize, value: u32) {
    blob[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Patch `blob` and check the restore fails with `Corrupt(what)` and leaves
/// the machine as it was.
fn assert_rejected(
    gba: &mut Machine,
    blob: &[u8],
    patch: impl FnOnce(&mut Vec<u8>),
    what: &'static str,
) {
    let mut blob = blob.to_vec();
    patch(&mut blob);
    let before = gba.save_state().unwrap();
    assert_eq!(gba.load_state(&blob), Err(StateError::Corrupt(what)));
    assert_eq!(gba.save_state().unwrap(), before);
}

fn running_machine() -> Machine {
    let mut gba = machine_with(irq_rom(&VBLANK_TAIL).rom);
    run_frames(&mut gba, 2);
    gba
}

#[test]
fn restore_then_run_matches_original_run() {
    let mut gba = running_machine();
    let blob = gba.save_state().unwrap();

    run_frames(&mut gba, 2);
    let regs = gba.cpu.regs.clone();
    let cycles = gba.bus.cycles;
    let frame = gba.framebuffer().to_vec();
    let count = counter(&gba);

    gba.load_state(&blob).unwrap();
    assert_eq!(gba.save_state().unwrap(), blob);
    run_frames(&mut gba, 2);
    assert_eq!(gba.cpu.regs, regs);
    assert_eq!(gba.bus.cycles, cycles);
    assert_eq!(gba.framebuffer(), &frame[..]);
    assert_eq!(counter(&gba), count);
}

#[test]
fn state_moves_between_machines() {
    let gba = running_machine();
    let blob = gba.save_state().unwrap();

    let mut other = machine_with(irq_rom(&VBLANK_TAIL).rom);
    other.load_state(&blob).unwrap();
    assert_eq!(other.cpu.regs, gba.cpu.regs);
    assert_eq!(other.cpu.halted, gba.cpu.halted);
    assert_eq!(other.ppu, gba.ppu);
    assert_eq!(other.bus.ewram, gba.bus.ewram);
    assert_eq!(other.bus.iwram, gba.bus.iwram);
    assert_eq!(other.bus.video, gba.bus.video);
}

#[test]
fn unknown_version_is_rejected_without_changes() {
    let mut gba = running_machine();
    let mut blob = gba.save_state().unwrap();
    blob[4..6].copy_from_slice(&99u16.to_le_bytes());

    let before = gba.save_state().unwrap();
    let err = gba.load_state(&blob).unwrap_err();
    assert_eq!(
        err,
        StateError::VersionMismatch {
            found: 99,
            supported: STATE_VERSION
        }
    );
    assert_eq!(gba.save_state().unwrap(), before);
}

#[test]
fn wrong_memory_size_is_rejected() {
    let mut gba = running_machine();
    let mut blob = gba.save_state().unwrap();
    let bus = blob
        .windows(4)
        .position(|w| w == b"BUS ")
        .expect("bus section");
    // Tag, section length, then the EWRAM block length.
    let ewram_len = bus + 8;
    blob[ewram_len..ewram_len + 4].copy_from_slice(&0x2_0000u32.to_le_bytes());

    gba.bus.write(0x0200_0000, Width::Word, 0x1234_5678);
    let err = gba.load_state(&blob).unwrap_err();
    assert!(matches!(
        err,
        StateError::SizeMismatch {
            region: "EWRAM",
            expected: 0x4_0000,
            found: 0x2_0000
        }
    ));
    assert_eq!(gba.bus.peek(0x0200_0000, Width::Word), 0x1234_5678);
}

#[test]
fn flash_contents_are_part_of_the_state() {
    let mut rom = arm_rom(&[ARM_SPIN]);
    rom[0x300..0x30C].copy_from_slice(b"FLASH1M_V103");
    let mut gba = machine_with(rom);
    let program = |gba: &mut Machine, addr: u32, value: u32| {
        gba.bus.write(0x0E00_5555, Width::Byte, 0xAA);
        gba.bus.write(0x0E00_2AAA, Width::Byte, 0x55);
        gba.bus.write(0x0E00_5555, Width::Byte, 0xA0);
        gba.bus.write(addr, Width::Byte, value);
    };
    program(&mut gba, 0x0E00_0010, 0x42);
    let blob = gba.save_state().unwrap();

    program(&mut gba, 0x0E00_0010, 0x00);
    assert_eq!(gba.bus.read(0x0E00_0010, Width::Byte), 0x00);
    gba.load_state(&blob).unwrap();
    assert_eq!(gba.bus.read(0x0E00_0010, Width::Byte), 0x42);
}

#[test]
fn out_of_range_timing_state_is_rejected() {
    let mut gba = running_machine();
    let blob = gba.save_state().unwrap();
    let ppu = section(&blob, b"PPU ");
    let cpu = section(&blob, b"CPU ");
    let timers = section(&blob, b"TIMR");
    let dma = section(&blob, b"DMA ");

    assert_rejected(
        &mut gba,
        &blob,
        |b| b[ppu..ppu + 2].copy_from_slice(&228u16.to_le_bytes()),
        "scanline",
    );
    assert_rejected(
        &mut gba,
        &blob,
        |b| put_u32(b, ppu + 2, 5000),
        "scanline cycle",
    );
    // r0-r15, then CPSR with its mode bits cleared.
    assert_rejected(&mut gba, &blob, |b| b[cpu + 64] &= !0x1F, "CPU mode");
    assert_rejected(
        &mut gba,
        &blob,
        |b| put_u32(b, timers + 6, 5000),
        "timer prescaler count",
    );
    // src, dst, count, control, latched src and dst, then the latched count.
    assert_rejected(
        &mut gba,
        &blob,
        |b| put_u32(b, dma + 20, 0x2_0000),
        "DMA word count",
    );

    // The machine keeps running after all of that.
    let count = counter(&gba);
    run_frames(&mut gba, 1);
    assert_eq!(counter(&gba), count + 1);
}

#[test]
fn out_of_range_flash_bank_is_rejected() {
    let mut rom = arm_rom(&[ARM_SPIN]);
    rom[0x300..0x30C].copy_from_slice(b"FLASH1M_V103");
    let mut gba = machine_with(rom);
    let blob = gba.save_state().unwrap();
    // Kind, data length, data, command state, four flags, then the bank.
    let bank = section(&blob, b"BKUP") + 1 + 4 + 0x2_0000 + 1 + 4;
    assert_eq!(blob[bank], 0);
    assert_rejected(&mut gba, &blob, |b| b[bank] = 2, "Flash bank");
    run_frames(&mut gba, 1);
}

#[test]
fn out_of_range_eeprom_state_is_rejected() {
    let mut rom = arm_rom(&[ARM_SPIN]);
    rom[0x300..0x30B].copy_from_slice(b"EEPROM_V124");
    let mut gba = machine_with(rom);
    let Some(Backup::Eeprom(eeprom)) = gba.bus.cart.as_mut().map(|c| &mut c.backup) else {
        panic!("expected an EEPROM cartridge");
    };
    eeprom.state = EepromState::Reading { pos: 3 };
    eeprom.addr_bits = Some(14);
    let blob = gba.save_state().unwrap();

    // Kind, data length, data, state tag, then the read position.
    let pos = section(&blob, b"BKUP") + 1 + 4 + 0x2000 + 1;
    let addr_bits = pos + 4;
    let received = addr_bits + 1 + 16;
    assert_eq!(blob[addr_bits], 14);

    assert_rejected(
        &mut gba,
        &blob,
        |b| put_u32(b, pos, 68),
        "EEPROM read position",
    );
    assert_rejected(
        &mut gba,
        &blob,
        |b| b[addr_bits] = 9,
        "EEPROM address width",
    );
    assert_rejected(
        &mut gba,
        &blob,
        |b| put_u32(b, received, 200),
        "EEPROM bit count",
    );

    gba.load_state(&blob).unwrap();
    for _ in 0..70 {
        gba.bus.read(0x0D00_0000, Width::Half);
    }
}
