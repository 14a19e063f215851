use crate::interrupt::{Interrupt, InterruptState};

const CTRL_PRESCALER: u16 = 0x0003;
const CTRL_CASCADE: u16 = 0x0004;
const CTRL_IRQ: u16 = 0x0040;
const CTRL_START: u16 = 0x0080;
const CTRL_MASK: u16 = CTRL_PRESCALER | CTRL_CASCADE | CTRL_IRQ | CTRL_START;

/// log2 of the prescaler divider selected by TMxCNT_H bits 0-1.
const PRESCALER_SHIFT: [u32; 4] = [0, 6, 8, 10];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    /// Value loaded on start and on every overflow.
    pub reload: u16,
    /// Live counter (TMxCNT_L reads).
    pub counter: u16,
    /// TMxCNT_H.
    pub control: u16,
    /// Cycles accumulated towards the next prescaled tick.
    pub prescaler_acc: u32,
}

impl Timer {
    #[inline]
    fn running(&self) -> bool {
        self.control & CTRL_START != 0
    }

    #[inline]
    fn shift(&self) -> u32 {
        PRESCALER_SHIFT[(self.control & CTRL_PRESCALER) as usize]
    }

    /// Advance by `ticks` counter increments, returning the number of
    /// overflows.
    fn add_ticks(&mut self, ticks: u32) -> u32 {
        if ticks == 0 {
            return 0;
        }
        let sum = self.counter as u32 + ticks;
        if sum < 0x1_0000 {
            self.counter = sum as u16;
            return 0;
        }
        let period = 0x1_0000 - self.reload as u32;
        let excess = sum - 0x1_0000;
        self.counter = (self.reload as u32 + excess % period) as u16;
        1 + excess / period
    }
}

/// The four cascadable hardware timers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timers {
    pub units: [Timer; 4],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_counter(&self, index: usize) -> u16 {
        self.units[index].counter
    }

    pub fn read_control(&self, index: usize) -> u16 {
        self.units[index].control
    }

    pub fn write_reload(&mut self, index: usize, value: u16) {
        self.units[index].reload = value;
    }

    pub fn write_control(&mut self, index: usize, value: u16) {
        let timer = &mut self.units[index];
        let was_running = timer.running();
        let mut value = value & CTRL_MASK;
        if index == 0 {
            // Timer 0 has nothing to cascade from.
            value &= !CTRL_CASCADE;
        }
        timer.control = value;
        if !was_running && timer.running() {
            timer.counter = timer.reload;
            timer.prescaler_acc = 0;
        }
    }

    /// Advance all timers by `cycles` system clocks, raising overflow IRQs
    /// and feeding count-up timers.
    pub fn step(&mut self, cycles: u32, irq: &mut InterruptState) {
        let mut carry = 0u32;
        for (index, timer) in self.units.iter_mut().enumerate() {
            if !timer.running() {
                carry = 0;
                continue;
            }
            let ticks = if timer.control & CTRL_CASCADE != 0 {
                carry
            } else {
                let shift = timer.shift();
                timer.prescaler_acc += cycles;
                let ticks = timer.prescaler_acc >> shift;
                timer.prescaler_acc &= (1 << shift) - 1;
                ticks
            };
            let overflows = timer.add_ticks(ticks);
            if overflows > 0 && timer.control & CTRL_IRQ != 0 {
                irq.request(Interrupt::timer(index));
            }
            carry = overflows;
        }
    }

    /// Cycles until the earliest free-running timer overflows, if any.
    pub fn cycles_until_overflow(&self) -> Option<u32> {
        self.units
            .iter()
            .filter(|t| t.running() && t.control & CTRL_CASCADE == 0)
            .map(|t| {
                let remaining = 0x1_0000 - t.counter as u32;
                (remaining << t.shift()).saturating_sub(t.prescaler_acc).max(1)
            })
            .min()
    }
}
