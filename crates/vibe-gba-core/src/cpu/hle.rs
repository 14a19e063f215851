//! High-level emulation of the BIOS software interrupts, used when no
//! BIOS image is loaded.
//!
//! Calling conventions and results follow GBATEK's "BIOS Functions"
//! chapter. Everything runs through the bus so wait states are charged the
//! same as for program code.

use std::f64::consts::PI;

use super::Cpu;
use crate::bus::{Bus, IWRAM_SIZE, Width};

/// Interrupt check flags the IRQ handler ORs in for IntrWait.
pub const BIOS_IRQ_FLAGS: u32 = 0x0300_7FF8;
/// Nonzero selects EWRAM as the SoftReset return target.
const SOFT_RESET_FLAG: u32 = 0x0300_7FFA;
/// Top of IWRAM that SoftReset and RegisterRamReset treat as BIOS stack.
const IWRAM_RESERVED: usize = 0x200;

pub fn call(cpu: &mut Cpu, bus: &mut Bus, number: u32, ret: u32) {
    let swi_addr = ret.wrapping_sub(if cpu.regs.thumb() { 2 } else { 4 });
    cpu_trace!("SWI {:#04X} r0={:08X} r1={:08X} r2={:08X}", number, cpu.regs.r[0], cpu.regs.r[1], cpu.regs.r[2]);
    match number {
        0x00 => soft_reset(cpu, bus),
        0x01 => register_ram_reset(bus, cpu.regs.r[0]),
        0x02 | 0x03 => cpu.halted = true,
        0x04 => intr_wait(cpu, bus, swi_addr),
        0x05 => {
            if !cpu.intr_wait_resume {
                cpu.regs.r[0] = 1;
            }
            cpu.regs.r[1] = 1;
            intr_wait(cpu, bus, swi_addr);
        }
        0x06 => {
            let (num, den) = (cpu.regs.r[0] as i32, cpu.regs.r[1] as i32);
            div(cpu, num, den);
        }
        0x07 => {
            let (den, num) = (cpu.regs.r[0] as i32, cpu.regs.r[1] as i32);
            div(cpu, num, den);
        }
        0x08 => cpu.regs.r[0] = cpu.regs.r[0].isqrt(),
        0x0A => cpu.regs.r[0] = arctan2(cpu.regs.r[0] as i16, cpu.regs.r[1] as i16),
        0x0B => cpu_set(cpu, bus),
        0x0C => cpu_fast_set(cpu, bus),
        0x0E => bg_affine_set(cpu, bus),
        0x0F => obj_affine_set(cpu, bus),
        _ => log::warn!("unimplemented BIOS call {number:#04X} at {swi_addr:08X}"),
    }
}

fn soft_reset(cpu: &mut Cpu, bus: &mut Bus) {
    let to_ewram = bus.read(SOFT_RESET_FLAG, Width::Byte) != 0;
    bus.iwram[IWRAM_SIZE - IWRAM_RESERVED..].fill(0);
    cpu.reset_to_cartridge();
    let target = if to_ewram { 0x0200_0000 } else { super::CART_ENTRY };
    cpu.write_pc(target);
}

fn register_ram_reset(bus: &mut Bus, flags: u32) {
    if flags & 0x01 != 0 {
        bus.ewram.fill(0);
    }
    if flags & 0x02 != 0 {
        bus.iwram[..IWRAM_SIZE - IWRAM_RESERVED].fill(0);
    }
    if flags & 0x04 != 0 {
        bus.video.palette.fill(0);
    }
    if flags & 0x08 != 0 {
        bus.video.vram.fill(0);
    }
    if flags & 0x10 != 0 {
        bus.video.oam.fill(0);
    }
    if flags & 0x20 != 0 {
        for offset in (0x120..0x160).step_by(2) {
            bus.write_io16(offset, 0);
        }
    }
    if flags & 0x40 != 0 {
        for offset in (0x060..0x0B0).step_by(2) {
            bus.write_io16(offset, 0);
        }
    }
    if flags & 0x80 != 0 {
        for offset in (0x000..0x060).step_by(2).chain((0x0B0..0x120).step_by(2)) {
            bus.write_io16(offset, 0);
        }
        bus.write_io16(0x000, 0x0080);
    }
}

/// IntrWait: sleep until one of the interrupts in `r1` has been flagged at
/// [`BIOS_IRQ_FLAGS`] by the program's handler. The SWI is re-executed after
/// each wake-up until that happens.
fn intr_wait(cpu: &mut Cpu, bus: &mut Bus, swi_addr: u32) {
    bus.irq.write_master_enable(1);
    let mask = cpu.regs.r[1] as u16;
    let flags = bus.read(BIOS_IRQ_FLAGS, Width::Half) as u16;
    let flags = if cpu.regs.r[0] != 0 && !cpu.intr_wait_resume {
        flags & !mask
    } else {
        flags
    };

    if flags & mask != 0 {
        bus.write(BIOS_IRQ_FLAGS, Width::Half, (flags & !mask) as u32);
        cpu.intr_wait_resume = false;
    } else {
        bus.write(BIOS_IRQ_FLAGS, Width::Half, flags as u32);
        cpu.intr_wait_resume = true;
        cpu.halted = true;
        cpu.write_pc(swi_addr);
    }
}

fn div(cpu: &mut Cpu, num: i32, den: i32) {
    if den == 0 {
        log::warn!("BIOS Div by zero ({num} / 0)");
        cpu.regs.r[0] = if num < 0 { u32::MAX } else { 1 };
        cpu.regs.r[1] = num as u32;
        cpu.regs.r[3] = 1;
        return;
    }
    let quot = num.wrapping_div(den);
    cpu.regs.r[0] = quot as u32;
    cpu.regs.r[1] = num.wrapping_rem(den) as u32;
    cpu.regs.r[3] = quot.unsigned_abs();
}

/// Angle of (x, y) as a fraction of a full turn, 0..=0xFFFF.
fn arctan2(x: i16, y: i16) -> u32 {
    if x == 0 && y == 0 {
        return 0;
    }
    let mut angle = (y as f64).atan2(x as f64);
    if angle < 0.0 {
        angle += 2.0 * PI;
    }
    ((angle / (2.0 * PI) * 65536.0).round() as u32) & 0xFFFF
}

fn cpu_set(cpu: &mut Cpu, bus: &mut Bus) {
    let (src, dst, ctrl) = (cpu.regs.r[0], cpu.regs.r[1], cpu.regs.r[2]);
    let count = ctrl & 0x1F_FFFF;
    let fill = ctrl & (1 << 24) != 0;
    let (width, unit) = if ctrl & (1 << 26) != 0 { (Width::Word, 4) } else { (Width::Half, 2) };
    if src < 0x0200_0000 {
        log::warn!("CpuSet from BIOS area {src:08X} ignored");
        return;
    }
    let src = src & !(unit - 1);
    let dst = dst & !(unit - 1);
    let fill_value = bus.read(src, width);
    for i in 0..count {
        let offset = i.wrapping_mul(unit);
        let value = if fill {
            fill_value
        } else {
            bus.read(src.wrapping_add(offset), width)
        };
        bus.write(dst.wrapping_add(offset), width, value);
    }
}

fn cpu_fast_set(cpu: &mut Cpu, bus: &mut Bus) {
    let (src, dst, ctrl) = (cpu.regs.r[0] & !3, cpu.regs.r[1] & !3, cpu.regs.r[2]);
    let count = ((ctrl & 0x1F_FFFF) + 7) & !7;
    let fill = ctrl & (1 << 24) != 0;
    if src < 0x0200_0000 {
        log::warn!("CpuFastSet from BIOS area {src:08X} ignored");
        return;
    }
    let fill_value = bus.read(src, Width::Word);
    for i in 0..count {
        let value = if fill {
            fill_value
        } else {
            bus.read(src.wrapping_add(i * 4), Width::Word)
        };
        bus.write(dst.wrapping_add(i * 4), Width::Word, value);
    }
}

/// sin/cos of an 8-bit BIOS angle in 1.14 fixed point.
fn sin_cos(angle: u16) -> (i32, i32) {
    let theta = (angle >> 8) as f64 * 2.0 * PI / 256.0;
    (
        (theta.sin() * 16384.0).round() as i32,
        (theta.cos() * 16384.0).round() as i32,
    )
}

fn bg_affine_set(cpu: &mut Cpu, bus: &mut Bus) {
    let (mut src, mut dst, count) = (cpu.regs.r[0], cpu.regs.r[1], cpu.regs.r[2]);
    for _ in 0..count {
        let orig_x = bus.read(src, Width::Word) as i32;
        let orig_y = bus.read(src.wrapping_add(4), Width::Word) as i32;
        let disp_x = bus.read(src.wrapping_add(8), Width::Half) as i16 as i32;
        let disp_y = bus.read(src.wrapping_add(10), Width::Half) as i16 as i32;
        let scale_x = bus.read(src.wrapping_add(12), Width::Half) as i16 as i32;
        let scale_y = bus.read(src.wrapping_add(14), Width::Half) as i16 as i32;
        let (sin, cos) = sin_cos(bus.read(src.wrapping_add(16), Width::Half) as u16);

        let pa = (scale_x * cos) >> 14;
        let pb = -((scale_x * sin) >> 14);
        let pc = (scale_y * sin) >> 14;
        let pd = (scale_y * cos) >> 14;
        let offset = |a: i32, b: i32| a.wrapping_mul(disp_x).wrapping_add(b.wrapping_mul(disp_y));
        let x = orig_x.wrapping_sub(offset(pa, pb));
        let y = orig_y.wrapping_sub(offset(pc, pd));

        for (i, p) in [pa, pb, pc, pd].into_iter().enumerate() {
            bus.write(dst.wrapping_add(i as u32 * 2), Width::Half, p as u32);
        }
        bus.write(dst.wrapping_add(8), Width::Word, x as u32);
        bus.write(dst.wrapping_add(12), Width::Word, y as u32);
        src = src.wrapping_add(20);
        dst = dst.wrapping_add(16);
    }
}

fn obj_affine_set(cpu: &mut Cpu, bus: &mut Bus) {
    let (mut src, mut dst, count, stride) =
        (cpu.regs.r[0], cpu.regs.r[1], cpu.regs.r[2], cpu.regs.r[3]);
    for _ in 0..count {
        let scale_x = bus.read(src, Width::Half) as i16 as i32;
        let scale_y = bus.read(src.wrapping_add(2), Width::Half) as i16 as i32;
        let (sin, cos) = sin_cos(bus.read(src.wrapping_add(4), Width::Half) as u16);

        let params = [
            (scale_x * cos) >> 14,
            -((scale_x * sin) >> 14),
            (scale_y * sin) >> 14,
            (scale_y * cos) >> 14,
        ];
        for p in params {
            bus.write(dst, Width::Half, p as u32);
            dst = dst.wrapping_add(stride);
        }
        src = src.wrapping_add(8);
    }
}
