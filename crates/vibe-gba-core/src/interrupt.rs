/// Interrupt sources in IE/IF bit order (GBATEK "Interrupt Control").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Interrupt {
    VBlank = 0,
    HBlank = 1,
    VCount = 2,
    Timer0 = 3,
    Timer1 = 4,
    Timer2 = 5,
    Timer3 = 6,
    Serial = 7,
    Dma0 = 8,
    Dma1 = 9,
    Dma2 = 10,
    Dma3 = 11,
    Keypad = 12,
    GamePak = 13,
}

impl Interrupt {
    #[inline]
    pub const fn mask(self) -> u16 {
        1 << self as u16
    }

    pub const fn timer(index: usize) -> Self {
        match index {
            0 => Interrupt::Timer0,
            1 => Interrupt::Timer1,
            2 => Interrupt::Timer2,
            _ => Interrupt::Timer3,
        }
    }

    pub const fn dma(index: usize) -> Self {
        match index {
            0 => Interrupt::Dma0,
            1 => Interrupt::Dma1,
            2 => Interrupt::Dma2,
            _ => Interrupt::Dma3,
        }
    }
}

const IRQ_BITS: u16 = 0x3FFF;

/// IE / IF / IME.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptState {
    pub enable: u16,
    pub flags: u16,
    pub master_enable: bool,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn request(&mut self, irq: Interrupt) {
        self.flags |= irq.mask();
    }

    /// IF is write-one-to-clear.
    #[inline]
    pub fn acknowledge(&mut self, bits: u16) {
        self.flags &= !bits;
    }

    pub fn write_enable(&mut self, value: u16) {
        self.enable = value & IRQ_BITS;
    }

    pub fn write_master_enable(&mut self, value: u16) {
        self.master_enable = value & 1 != 0;
    }

    /// An enabled source has fired, regardless of IME. Used to wake from HALT.
    #[inline]
    pub fn any_raised(&self) -> bool {
        self.enable & self.flags & IRQ_BITS != 0
    }

    /// An interrupt should be taken (the CPSR I bit is checked by the CPU).
    #[inline]
    pub fn pending(&self) -> bool {
        self.master_enable && self.any_raised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_needs_master_enable_and_both_bits() {
        let mut irq = InterruptState::new();
        irq.request(Interrupt::VBlank);
        assert!(!irq.pending());

        irq.write_enable(Interrupt::VBlank.mask());
        assert!(irq.any_raised());
        assert!(!irq.pending());

        irq.write_master_enable(1);
        assert!(irq.pending());

        irq.acknowledge(Interrupt::VBlank.mask());
        assert!(!irq.pending());
    }

    #[test]
    fn acknowledge_only_clears_written_bits() {
        let mut irq = InterruptState::new();
        irq.request(Interrupt::Timer0);
        irq.request(Interrupt::Dma3);
        irq.acknowledge(Interrupt::Timer0.mask());
        assert_eq!(irq.flags, Interrupt::Dma3.mask());
    }
}
