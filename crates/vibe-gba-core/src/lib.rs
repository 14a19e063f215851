//! Game Boy Advance emulation core.
//!
//! This crate contains the platform-agnostic machine (CPU/bus/PPU/timers/DMA).
//! Frontends drive it through the [`gba::Machine`] facade: load a cartridge,
//! call [`gba::Machine::run_frame`] once per frame and present the returned
//! framebuffer.

/// Cartridge backup memory (SRAM, Flash, EEPROM).
pub mod backup;

/// Memory map, wait states and the I/O register file.
pub mod bus;

/// ROM image validation, header parsing and battery saves.
pub mod cartridge;

/// Machine-wide configuration.
pub mod config;

/// ARM7TDMI CPU core.
pub mod cpu;

/// DMA channel registers.
pub mod dma;

/// High-level facade that owns the CPU, bus and PPU and runs frames.
pub mod gba;

/// Keypad register and the cross-thread input queue.
pub mod input;

/// IE/IF/IME interrupt controller.
pub mod interrupt;

/// Scanline timing, interrupts and the double-buffered framebuffer.
pub mod ppu;

/// Background, sprite, window and blending compositor.
pub mod render;

/// Versioned save-state capture and restore.
pub mod state;

/// The four hardware timers.
pub mod timer;

/// VRAM, palette RAM, OAM and the LCD registers.
pub mod video;

pub use cartridge::LoadError;
pub use config::{IllegalInstructionPolicy, MachineConfig};
pub use cpu::CpuError;
pub use gba::Machine;
pub use input::Button;
pub use state::StateError;
