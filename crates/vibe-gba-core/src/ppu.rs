use crate::interrupt::{Interrupt, InterruptState};
use crate::render::{self, SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::video::{
    DISPSTAT_HBLANK, DISPSTAT_HBLANK_IRQ, DISPSTAT_VBLANK, DISPSTAT_VBLANK_IRQ, DISPSTAT_VCOUNT,
    DISPSTAT_VCOUNT_IRQ, Video,
};

#[cfg(feature = "ppu-trace")]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "vibe_gba_core::ppu", $($arg)*);
    };
}

#[cfg(not(feature = "ppu-trace"))]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {};
}

// Timing in CPU cycles
pub const CYCLES_PER_DOT: u32 = 4;
pub const DOTS_PER_LINE: u32 = 308;
const HBLANK_START: u32 = SCREEN_WIDTH as u32 * CYCLES_PER_DOT;
pub const LINE_CYCLES: u32 = DOTS_PER_LINE * CYCLES_PER_DOT;
pub const LINES_PER_FRAME: u16 = 228;
pub const FRAME_CYCLES: u32 = LINE_CYCLES * LINES_PER_FRAME as u32;

const VBLANK_LINE: u16 = SCREEN_HEIGHT as u16;
/// The VBlank flag drops one line before the frame wraps.
const VBLANK_FLAG_CLEAR_LINE: u16 = LINES_PER_FRAME - 1;

pub const FRAME_PIXELS: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

/// DMA start conditions raised while stepping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PpuEvents {
    /// HBlank began on a visible line.
    pub hblank: bool,
    /// Line 160 was entered and the frame buffers were swapped.
    pub vblank: bool,
}

impl PpuEvents {
    fn merge(&mut self, other: PpuEvents) {
        self.hblank |= other.hblank;
        self.vblank |= other.vblank;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ppu {
    /// Current scanline, 0-227. Mirrored to VCOUNT.
    pub line: u16,
    /// Cycles into the current line, 0..LINE_CYCLES.
    pub line_cycle: u32,
    /// The current line has been entered but not yet composited.
    pub render_pending: bool,
    pub front: Box<[u32]>,
    pub back: Box<[u32]>,
    /// Set on every buffer swap; cleared by [`Ppu::take_frame_ready`].
    pub frame_ready: bool,
    pub frame_counter: u64,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            line: 0,
            line_cycle: 0,
            render_pending: true,
            front: vec![0; FRAME_PIXELS].into_boxed_slice(),
            back: vec![0; FRAME_PIXELS].into_boxed_slice(),
            frame_ready: false,
            frame_counter: 0,
        }
    }

    pub fn framebuffer(&self) -> &[u32] {
        &self.front
    }

    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    /// Cycles until the next HBlank or line boundary.
    pub fn cycles_until_event(&self) -> u32 {
        if self.line_cycle < HBLANK_START {
            HBLANK_START - self.line_cycle
        } else {
            LINE_CYCLES - self.line_cycle
        }
    }

    /// Advance by `cycles` CPU cycles.
    pub fn step(&mut self, cycles: u32, video: &mut Video, irq: &mut InterruptState) -> PpuEvents {
        let mut events = PpuEvents::default();
        let mut remaining = cycles;
        loop {
            if self.render_pending {
                self.render_pending = false;
                self.render(video);
            }
            if remaining == 0 {
                break;
            }
            let advance = self.cycles_until_event().min(remaining);
            self.line_cycle += advance;
            remaining -= advance;

            if self.line_cycle == HBLANK_START {
                events.merge(self.enter_hblank(video, irq));
            } else if self.line_cycle == LINE_CYCLES {
                self.line_cycle = 0;
                events.merge(self.enter_line(self.line + 1, video, irq));
            }
        }
        events
    }

    fn render(&mut self, video: &mut Video) {
        let line = self.line as usize;
        if line >= SCREEN_HEIGHT {
            return;
        }
        let out = &mut self.back[line * SCREEN_WIDTH..(line + 1) * SCREEN_WIDTH];
        render::render_line(video, self.line, out);
        for params in &mut video.affine {
            params.advance_line();
        }
    }

    fn enter_hblank(&mut self, video: &mut Video, irq: &mut InterruptState) -> PpuEvents {
        video.dispstat |= DISPSTAT_HBLANK;
        if video.dispstat & DISPSTAT_HBLANK_IRQ != 0 {
            irq.request(Interrupt::HBlank);
        }
        PpuEvents {
            hblank: (self.line as usize) < SCREEN_HEIGHT,
            vblank: false,
        }
    }

    fn enter_line(&mut self, line: u16, video: &mut Video, irq: &mut InterruptState) -> PpuEvents {
        let mut events = PpuEvents::default();
        self.line = if line >= LINES_PER_FRAME { 0 } else { line };
        video.vcount = self.line;
        video.dispstat &= !DISPSTAT_HBLANK;
        ppu_trace!("line {} dispcnt={:04X}", self.line, video.dispcnt);

        match self.line {
            VBLANK_LINE => {
                video.dispstat |= DISPSTAT_VBLANK;
                if video.dispstat & DISPSTAT_VBLANK_IRQ != 0 {
                    irq.request(Interrupt::VBlank);
                }
                std::mem::swap(&mut self.front, &mut self.back);
                self.frame_ready = true;
                self.frame_counter = self.frame_counter.wrapping_add(1);
                for params in &mut video.affine {
                    params.reload();
                }
                events.vblank = true;
            }
            VBLANK_FLAG_CLEAR_LINE => video.dispstat &= !DISPSTAT_VBLANK,
            _ => {}
        }

        let target = video.dispstat >> 8;
        if self.line == target {
            video.dispstat |= DISPSTAT_VCOUNT;
            if video.dispstat & DISPSTAT_VCOUNT_IRQ != 0 {
                irq.request(Interrupt::VCount);
            }
        } else {
            video.dispstat &= !DISPSTAT_VCOUNT;
        }

        self.render_pending = (self.line as usize) < SCREEN_HEIGHT;
        events
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Ppu, Video, InterruptState) {
        let mut video = Video::new();
        video.dispcnt = 0;
        (Ppu::new(), video, InterruptState::new())
    }

    #[test]
    fn frame_timing_constants() {
        assert_eq!(LINE_CYCLES, 1232);
        assert_eq!(FRAME_CYCLES, 280_896);
    }

    #[test]
    fn hblank_flag_and_irq() {
        let (mut ppu, mut video, mut irq) = setup();
        video.dispstat = DISPSTAT_HBLANK_IRQ;
        let events = ppu.step(HBLANK_START - 1, &mut video, &mut irq);
        assert!(!events.hblank);
        assert_eq!(video.dispstat & DISPSTAT_HBLANK, 0);

        let events = ppu.step(1, &mut video, &mut irq);
        assert!(events.hblank);
        assert_ne!(video.dispstat & DISPSTAT_HBLANK, 0);
        assert_ne!(irq.flags & Interrupt::HBlank.mask(), 0);

        ppu.step(LINE_CYCLES - HBLANK_START, &mut video, &mut irq);
        assert_eq!(ppu.line, 1);
        assert_eq!(video.vcount, 1);
        assert_eq!(video.dispstat & DISPSTAT_HBLANK, 0);
    }

    #[test]
    fn vblank_swaps_exactly_once_per_frame() {
        let (mut ppu, mut video, mut irq) = setup();
        video.dispstat = DISPSTAT_VBLANK_IRQ;
        let mut swaps = 0;
        let mut stepped = 0;
        while stepped < FRAME_CYCLES {
            let events = ppu.step(7, &mut video, &mut irq);
            stepped += 7;
            if events.vblank {
                swaps += 1;
                assert_eq!(ppu.line, 160);
                assert_ne!(video.dispstat & DISPSTAT_VBLANK, 0);
            }
        }
        assert_eq!(swaps, 1);
        assert!(ppu.take_frame_ready());
        assert!(!ppu.take_frame_ready());
        assert_ne!(irq.flags & Interrupt::VBlank.mask(), 0);
        assert_eq!(ppu.line, 0);
        assert_eq!(video.dispstat & DISPSTAT_VBLANK, 0);
    }

    #[test]
    fn hblank_dma_only_on_visible_lines() {
        let (mut ppu, mut video, mut irq) = setup();
        ppu.step(LINE_CYCLES * 160, &mut video, &mut irq);
        assert_eq!(ppu.line, 160);
        let events = ppu.step(HBLANK_START, &mut video, &mut irq);
        assert!(!events.hblank);
    }

    #[test]
    fn vcount_match_irq() {
        let (mut ppu, mut video, mut irq) = setup();
        video.dispstat = (3 << 8) | DISPSTAT_VCOUNT_IRQ;
        ppu.step(LINE_CYCLES * 3, &mut video, &mut irq);
        assert_eq!(ppu.line, 3);
        assert_ne!(video.dispstat & DISPSTAT_VCOUNT, 0);
        assert_ne!(irq.flags & Interrupt::VCount.mask(), 0);
        ppu.step(LINE_CYCLES, &mut video, &mut irq);
        assert_eq!(video.dispstat & DISPSTAT_VCOUNT, 0);
    }

    #[test]
    fn rendered_line_lands_in_front_buffer_after_vblank() {
        let (mut ppu, mut video, mut irq) = setup();
        video.palette[0..2].copy_from_slice(&0x001Fu16.to_le_bytes());
        ppu.step(LINE_CYCLES * 160, &mut video, &mut irq);
        assert!(ppu.framebuffer().iter().all(|&p| p == 0x00FF_0000));
    }

    #[test]
    fn affine_reference_reloads_at_vblank() {
        let (mut ppu, mut video, mut irq) = setup();
        video.affine[0].pd = 0x100;
        ppu.step(LINE_CYCLES * 10 + 1, &mut video, &mut irq);
        assert_eq!(video.affine[0].internal_y, 11 * 0x100);
        ppu.step(LINE_CYCLES * 150, &mut video, &mut irq);
        assert_eq!(video.affine[0].internal_y, 0);
    }
}
