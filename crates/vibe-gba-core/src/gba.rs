use crate::{
    bus::{Bus, Width},
    cartridge::{Cartridge, LoadError},
    config::MachineConfig,
    cpu::{Cpu, CpuError},
    dma::DmaTiming,
    input::{Button, InputQueue, InputSender},
    ppu::{FRAME_CYCLES, Ppu},
    state::{self, StateError},
};

/// Upper bound on the cycles one `run_frame` call may take.
const FRAME_GUARD_CYCLES: u64 = 2 * FRAME_CYCLES as u64;

pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
    pub ppu: Ppu,
    config: MachineConfig,
    input: InputQueue,
    /// Bus cycle count already handed to the timers and PPU.
    drained: u64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let mut machine = Self {
            cpu: Cpu::new(config.illegal_instruction),
            bus: Bus::new(&config),
            ppu: Ppu::new(),
            config,
            input: InputQueue::new(),
            drained: 0,
        };
        machine.reset();
        machine
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Map a 16 KiB BIOS image in place of the built-in stub and reset.
    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), LoadError> {
        self.bus.load_bios(data)?;
        self.reset();
        Ok(())
    }

    /// Validate and insert a ROM image, then reset.
    pub fn load_cartridge(&mut self, rom: Vec<u8>) -> Result<(), LoadError> {
        let cart = Cartridge::load(rom)?;
        self.insert_cartridge(cart);
        Ok(())
    }

    /// Insert an already loaded cartridge (e.g. from [`Cartridge::from_file`])
    /// and reset.
    pub fn insert_cartridge(&mut self, cart: Cartridge) {
        self.bus.load_cart(cart);
        self.reset();
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.bus.cart.as_ref()
    }

    /// Back to power-on state. BIOS, cartridge ROM, backup memory and held
    /// buttons survive.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.ppu = Ppu::new();
        self.drained = 0;
        if self.bus.bios_loaded() && !self.config.skip_bios {
            self.cpu.reset_to_bios();
        } else {
            self.cpu.reset_to_cartridge();
            // The BIOS leaves POSTFLG set once it has booted.
            self.bus.write(0x0400_0300, Width::Byte, 1);
            self.bus.cycles = 0;
        }
    }

    pub fn press_button(&mut self, button: Button) {
        self.bus.keypad.press(button);
        self.bus.update_keypad_irq();
    }

    pub fn release_button(&mut self, button: Button) {
        self.bus.keypad.release(button);
        self.bus.update_keypad_irq();
    }

    /// Handle for pressing buttons from another thread. Events are applied
    /// between instructions.
    pub fn input_sender(&self) -> InputSender {
        self.input.sender()
    }

    /// The last completed frame, 240x160 `0x00RRGGBB` pixels.
    pub fn framebuffer(&self) -> &[u32] {
        self.ppu.framebuffer()
    }

    /// The machine stopped on an illegal instruction and needs a reset.
    pub fn fault(&self) -> Option<CpuError> {
        self.cpu.fault()
    }

    /// Run until the PPU swaps in the next frame and return it.
    pub fn run_frame(&mut self) -> Result<&[u32], CpuError> {
        if let Some(err) = self.cpu.fault() {
            return Err(err);
        }
        let start = self.bus.cycles;
        loop {
            if self.input.drain_into(&mut self.bus.keypad) {
                self.bus.update_keypad_irq();
            }
            if self.cpu.halted && self.bus.irq.any_raised() {
                self.cpu.halted = false;
            }
            if !self.cpu.halted && self.bus.irq.pending() && !self.cpu.irq_masked() {
                self.cpu.enter_irq(&mut self.bus);
            }

            if self.cpu.halted {
                let skip = self
                    .bus
                    .timers
                    .cycles_until_overflow()
                    .map_or(u32::MAX, |c| c.max(1))
                    .min(self.ppu.cycles_until_event());
                self.bus.idle(skip);
            } else {
                self.cpu.step(&mut self.bus)?;
            }
            self.catch_up();

            if self.ppu.take_frame_ready() {
                break;
            }
            if self.bus.cycles - start >= FRAME_GUARD_CYCLES {
                log::warn!("frame did not complete within {FRAME_GUARD_CYCLES} cycles");
                break;
            }
        }
        Ok(self.ppu.framebuffer())
    }

    /// Feed elapsed bus cycles to the timers and PPU, and start any DMA the
    /// PPU asked for. DMA adds cycles of its own, so loop until caught up.
    fn catch_up(&mut self) {
        while self.drained < self.bus.cycles {
            let cycles = (self.bus.cycles - self.drained).min(u32::MAX as u64) as u32;
            self.drained += cycles as u64;
            self.bus.timers.step(cycles, &mut self.bus.irq);
            let events = self.ppu.step(cycles, &mut self.bus.video, &mut self.bus.irq);
            if events.hblank {
                self.bus.trigger_dma(DmaTiming::HBlank);
            }
            if events.vblank {
                self.bus.trigger_dma(DmaTiming::VBlank);
            }
        }
    }

    /// Serialize everything mutable except the ROM.
    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        state::capture(self)
    }

    /// Restore a blob from [`Machine::save_state`]. On error nothing changes.
    pub fn load_state(&mut self, blob: &[u8]) -> Result<(), StateError> {
        state::restore(self, blob)?;
        self.drained = self.bus.cycles;
        Ok(())
    }

    /// Write the cartridge's backup memory to its `.sav` file, if it has one.
    pub fn save_backup(&self) -> std::io::Result<()> {
        match &self.bus.cart {
            Some(cart) => cart.save_backup(),
            None => Ok(()),
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}
