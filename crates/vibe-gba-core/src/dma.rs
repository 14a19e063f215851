//! DMA channel registers. The transfers themselves run on the bus
//! ([`crate::bus::Bus::run_dma`]) since they are ordinary bus accesses.

const CNT_DEST_CTRL_SHIFT: u16 = 5;
const CNT_SRC_CTRL_SHIFT: u16 = 7;
const CNT_REPEAT: u16 = 0x0200;
const CNT_WORD: u16 = 0x0400;
const CNT_TIMING_SHIFT: u16 = 12;
const CNT_IRQ: u16 = 0x4000;
const CNT_ENABLE: u16 = 0x8000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaTiming {
    Immediate,
    VBlank,
    HBlank,
    /// Sound FIFO / video capture. Never triggered: audio is not emulated.
    Special,
}

impl DmaTiming {
    fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => DmaTiming::Immediate,
            1 => DmaTiming::VBlank,
            2 => DmaTiming::HBlank,
            _ => DmaTiming::Special,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressControl {
    Increment,
    Decrement,
    Fixed,
    /// Increment, and reload the destination on every repeat.
    IncrementReload,
}

impl AddressControl {
    fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => AddressControl::Increment,
            1 => AddressControl::Decrement,
            2 => AddressControl::Fixed,
            _ => AddressControl::IncrementReload,
        }
    }

    #[inline]
    pub fn step(self, unit: u32) -> u32 {
        match self {
            AddressControl::Increment | AddressControl::IncrementReload => unit,
            AddressControl::Decrement => unit.wrapping_neg(),
            AddressControl::Fixed => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaChannel {
    pub src: u32,
    pub dst: u32,
    pub count: u16,
    pub control: u16,
    /// Latched when the channel is enabled; advanced by transfers.
    pub internal_src: u32,
    pub internal_dst: u32,
    pub internal_count: u32,
}

impl DmaChannel {
    #[inline]
    pub fn enabled(&self) -> bool {
        self.control & CNT_ENABLE != 0
    }

    #[inline]
    pub fn timing(&self) -> DmaTiming {
        DmaTiming::from_bits(self.control >> CNT_TIMING_SHIFT)
    }

    #[inline]
    pub fn word_sized(&self) -> bool {
        self.control & CNT_WORD != 0
    }

    #[inline]
    pub fn repeat(&self) -> bool {
        self.control & CNT_REPEAT != 0
    }

    #[inline]
    pub fn irq_on_end(&self) -> bool {
        self.control & CNT_IRQ != 0
    }

    pub fn dest_control(&self) -> AddressControl {
        AddressControl::from_bits(self.control >> CNT_DEST_CTRL_SHIFT)
    }

    pub fn src_control(&self) -> AddressControl {
        AddressControl::from_bits(self.control >> CNT_SRC_CTRL_SHIFT)
    }

    pub fn disable(&mut self) {
        self.control &= !CNT_ENABLE;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dma {
    pub channels: [DmaChannel; 4],
}

impl Dma {
    pub fn new() -> Self {
        Self::default()
    }

    fn src_mask(index: usize) -> u32 {
        if index == 0 { 0x07FF_FFFF } else { 0x0FFF_FFFF }
    }

    fn dst_mask(index: usize) -> u32 {
        if index == 3 { 0x0FFF_FFFF } else { 0x07FF_FFFF }
    }

    /// Word count with the "0 means maximum" rule applied.
    pub fn full_count(index: usize, count: u16) -> u32 {
        let max = if index == 3 { 0x1_0000 } else { 0x4000 };
        let count = count as u32 & (max - 1);
        if count == 0 { max } else { count }
    }

    pub fn write_src(&mut self, index: usize, value: u32) {
        self.channels[index].src = value & Self::src_mask(index);
    }

    pub fn write_dst(&mut self, index: usize, value: u32) {
        self.channels[index].dst = value & Self::dst_mask(index);
    }

    pub fn write_count(&mut self, index: usize, value: u16) {
        self.channels[index].count = value;
    }

    /// Write DMAxCNT_H. Returns `true` when the channel should start
    /// transferring right away.
    pub fn write_control(&mut self, index: usize, value: u16) -> bool {
        let ch = &mut self.channels[index];
        let was_enabled = ch.enabled();
        // The game-pak DRQ bit only exists on DMA3.
        let writable = if index == 3 { 0xFFE0 } else { 0xF7E0 };
        ch.control = value & writable;
        if !was_enabled && ch.enabled() {
            ch.internal_src = ch.src;
            ch.internal_dst = ch.dst;
            ch.internal_count = Self::full_count(index, ch.count);
            return ch.timing() == DmaTiming::Immediate;
        }
        false
    }

    /// Enabled channels waiting on `timing`, in priority order.
    pub fn triggered(&self, timing: DmaTiming) -> impl Iterator<Item = usize> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter(move |(_, ch)| ch.enabled() && ch.timing() == timing)
            .map(|(i, _)| i)
    }

    /// Bookkeeping after a completed transfer block.
    pub fn finish(&mut self, index: usize) {
        let ch = &mut self.channels[index];
        if ch.repeat() && ch.timing() != DmaTiming::Immediate {
            ch.internal_count = Self::full_count(index, ch.count);
            if ch.dest_control() == AddressControl::IncrementReload {
                ch.internal_dst = ch.dst;
            }
        } else {
            ch.disable();
        }
    }
}
