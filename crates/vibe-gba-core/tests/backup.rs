mod common;

use std::fs;

use common::*;
use tempfile::tempdir;
use vibe_gba_core::Machine;
use vibe_gba_core::bus::Width;
use vibe_gba_core::cartridge::{Cartridge, SaveType};

fn rom_with_id(id: &[u8]) -> Vec<u8> {
    let mut rom = arm_rom(&[ARM_SPIN]);
    rom[0x300..0x300 + id.len()].copy_from_slice(id);
    rom
}

fn flash_command(gba: &mut Machine, cmd: u8) {
    gba.bus.write(0x0E00_5555, Width::Byte, 0xAA);
    gba.bus.write(0x0E00_2AAA, Width::Byte, 0x55);
    gba.bus.write(0x0E00_5555, Width::Byte, cmd as u32);
}

/// Copy `count` halfwords with DMA3 started immediately.
fn dma3(gba: &mut Machine, src: u32, dst: u32, count: u16) {
    gba.bus.write(REG_DMA3SAD, Width::Word, src);
    gba.bus.write(REG_DMA3DAD, Width::Word, dst);
    gba.bus.write(REG_DMA3CNT_L, Width::Half, count as u32);
    gba.bus.write(REG_DMA3CNT_H, Width::Half, 0x8000);
}

/// Lay a serial bit stream out in EWRAM, one bit per halfword.
fn stage_bits(gba: &mut Machine, bits: &[u8]) {
    for (i, &bit) in bits.iter().enumerate() {
        gba.bus.write(0x0200_0000 + i as u32 * 2, Width::Half, bit as u32);
    }
}

fn push_bits(bits: &mut Vec<u8>, value: u64, count: u32) {
    for i in (0..count).rev() {
        bits.push((value >> i) as u8 & 1);
    }
}

#[test]
fn save_type_comes_from_library_id() {
    let cases: [(&[u8], SaveType); 4] = [
        (b"SRAM_V113", SaveType::Sram),
        (b"FLASH512_V131", SaveType::Flash64K),
        (b"FLASH1M_V103", SaveType::Flash128K),
        (b"EEPROM_V124", SaveType::Eeprom),
    ];
    for (id, kind) in cases {
        let gba = machine_with(rom_with_id(id));
        assert_eq!(gba.cartridge().unwrap().save_type, kind);
    }
    let gba = machine_with(arm_rom(&[ARM_SPIN]));
    assert_eq!(gba.cartridge().unwrap().save_type, SaveType::None);
}

#[test]
fn sram_window_is_byte_wide() {
    let mut gba = machine_with(rom_with_id(b"SRAM_V113"));
    gba.bus.write(0x0E00_0004, Width::Byte, 0x5A);
    assert_eq!(gba.bus.read(0x0E00_0004, Width::Byte), 0x5A);
    assert_eq!(gba.bus.read(0x0E00_0004, Width::Half), 0x5A5A);
    // Mirrored every 32 KiB.
    assert_eq!(gba.bus.read(0x0E00_8004, Width::Byte), 0x5A);
}

#[test]
fn flash_id_program_and_bank_switch() {
    let mut gba = machine_with(rom_with_id(b"FLASH1M_V103"));

    flash_command(&mut gba, 0x90);
    assert_eq!(gba.bus.read(0x0E00_0000, Width::Byte), 0x62);
    assert_eq!(gba.bus.read(0x0E00_0001, Width::Byte), 0x13);
    flash_command(&mut gba, 0xF0);

    flash_command(&mut gba, 0xA0);
    gba.bus.write(0x0E00_1234, Width::Byte, 0x11);
    assert_eq!(gba.bus.read(0x0E00_1234, Width::Byte), 0x11);

    flash_command(&mut gba, 0xB0);
    gba.bus.write(0x0E00_0000, Width::Byte, 1);
    assert_eq!(gba.bus.read(0x0E00_1234, Width::Byte), 0xFF);
    flash_command(&mut gba, 0xA0);
    gba.bus.write(0x0E00_1234, Width::Byte, 0x22);

    flash_command(&mut gba, 0xB0);
    gba.bus.write(0x0E00_0000, Width::Byte, 0);
    assert_eq!(gba.bus.read(0x0E00_1234, Width::Byte), 0x11);

    let storage = gba.cartridge().unwrap().backup.storage();
    assert_eq!(storage[0x1234], 0x11);
    assert_eq!(storage[0x1_1234], 0x22);
}

#[test]
fn flash_sector_erase() {
    let mut gba = machine_with(rom_with_id(b"FLASH512_V131"));
    for addr in [0x0E00_0010, 0x0E00_1010] {
        flash_command(&mut gba, 0xA0);
        gba.bus.write(addr, Width::Byte, 0x00);
    }
    flash_command(&mut gba, 0x80);
    gba.bus.write(0x0E00_5555, Width::Byte, 0xAA);
    gba.bus.write(0x0E00_2AAA, Width::Byte, 0x55);
    gba.bus.write(0x0E00_1000, Width::Byte, 0x30);

    assert_eq!(gba.bus.read(0x0E00_0010, Width::Byte), 0x00);
    assert_eq!(gba.bus.read(0x0E00_1010, Width::Byte), 0xFF);
}

#[test]
fn eeprom_write_and_read_over_dma() {
    let mut gba = machine_with(rom_with_id(b"EEPROM_V124"));
    let block = 3u64;
    let payload = 0x0123_4567_89AB_CDEFu64;

    let mut bits = vec![1, 0];
    push_bits(&mut bits, block, 14);
    push_bits(&mut bits, payload, 64);
    bits.push(0);
    assert_eq!(bits.len(), 81);
    stage_bits(&mut gba, &bits);
    dma3(&mut gba, 0x0200_0000, 0x0D00_0000, 81);

    let mut request = vec![1, 1];
    push_bits(&mut request, block, 14);
    request.push(0);
    stage_bits(&mut gba, &request);
    dma3(&mut gba, 0x0200_0000, 0x0D00_0000, 17);
    dma3(&mut gba, 0x0D00_0000, 0x0200_1000, 68);

    let mut value = 0u64;
    for i in 0..68u32 {
        let bit = gba.bus.peek(0x0200_1000 + i * 2, Width::Half) as u64 & 1;
        if i < 4 {
            assert_eq!(bit, 0);
        } else {
            value = (value << 1) | bit;
        }
    }
    assert_eq!(value, payload);
    assert_eq!(
        &gba.cartridge().unwrap().backup.storage()[24..32],
        &payload.to_be_bytes()
    );
}

#[test]
fn battery_save_written_next_to_rom() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("game.gba");
    fs::write(&rom_path, rom_with_id(b"SRAM_V113")).unwrap();

    let mut gba = Machine::default();
    gba.insert_cartridge(Cartridge::from_file(&rom_path).unwrap());
    gba.bus.write(0x0E00_0000, Width::Byte, 0xAB);
    gba.save_backup().unwrap();

    let save_path = rom_path.with_extension("sav");
    let data = fs::read(&save_path).unwrap();
    assert_eq!(data.len(), 0x8000);
    assert_eq!(data[0], 0xAB);

    let mut fresh = Machine::default();
    fresh.insert_cartridge(Cartridge::from_file(&rom_path).unwrap());
    assert_eq!(fresh.bus.read(0x0E00_0000, Width::Byte), 0xAB);
}

#[test]
fn cartridge_without_backup_writes_no_file() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("plain.gba");
    fs::write(&rom_path, arm_rom(&[ARM_SPIN])).unwrap();

    let mut gba = Machine::default();
    gba.insert_cartridge(Cartridge::from_file(&rom_path).unwrap());
    gba.save_backup().unwrap();
    assert!(!rom_path.with_extension("sav").exists());
}
