use crossbeam_channel::{Receiver, Sender, TrySendError};

const KEY_MASK: u16 = 0x03FF;
const KEYCNT_IRQ_ENABLE: u16 = 0x4000;
const KEYCNT_AND_MODE: u16 = 0x8000;
// Bounded so a stuck producer cannot grow memory without limit.
const INPUT_QUEUE_DEPTH: usize = 256;

/// Logical controller buttons, in KEYINPUT bit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    Select,
    Start,
    Right,
    Left,
    Up,
    Down,
    R,
    L,
}

impl Button {
    pub const ALL: [Button; 10] = [
        Button::A,
        Button::B,
        Button::Select,
        Button::Start,
        Button::Right,
        Button::Left,
        Button::Up,
        Button::Down,
        Button::R,
        Button::L,
    ];

    #[inline]
    pub const fn mask(self) -> u16 {
        1 << self as u16
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let b = match name.to_ascii_lowercase().as_str() {
            "a" => Button::A,
            "b" => Button::B,
            "select" => Button::Select,
            "start" => Button::Start,
            "right" => Button::Right,
            "left" => Button::Left,
            "up" => Button::Up,
            "down" => Button::Down,
            "r" => Button::R,
            "l" => Button::L,
            _ => return None,
        };
        Some(b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputEvent {
    Press(Button),
    Release(Button),
}

/// KEYINPUT / KEYCNT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Keypad {
    pressed: u16,
    pub keycnt: u16,
}

impl Keypad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, button: Button) {
        self.pressed |= button.mask();
    }

    pub fn release(&mut self, button: Button) {
        self.pressed &= !button.mask();
    }

    pub fn apply(&mut self, event: InputEvent) {
        match event {
            InputEvent::Press(b) => self.press(b),
            InputEvent::Release(b) => self.release(b),
        }
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.pressed & button.mask() != 0
    }

    pub fn pressed_mask(&self) -> u16 {
        self.pressed
    }

    /// KEYINPUT is active-low.
    pub fn keyinput(&self) -> u16 {
        !self.pressed & KEY_MASK
    }

    pub fn write_keycnt(&mut self, value: u16) {
        self.keycnt = value & (KEY_MASK | KEYCNT_IRQ_ENABLE | KEYCNT_AND_MODE);
    }

    /// Whether KEYCNT currently asks for a keypad interrupt.
    pub fn irq_condition(&self) -> bool {
        if self.keycnt & KEYCNT_IRQ_ENABLE == 0 {
            return false;
        }
        let select = self.keycnt & KEY_MASK;
        if select == 0 {
            return false;
        }
        if self.keycnt & KEYCNT_AND_MODE != 0 {
            self.pressed & select == select
        } else {
            self.pressed & select != 0
        }
    }

    pub(crate) fn restore_pressed(&mut self, pressed: u16) {
        self.pressed = pressed & KEY_MASK;
    }
}

/// Cloneable handle for delivering button events from another thread.
///
/// Events are applied by the owning machine at instruction boundaries.
#[derive(Clone, Debug)]
pub struct InputSender {
    tx: Sender<InputEvent>,
}

impl InputSender {
    /// Returns `false` when the queue is full or the machine is gone.
    pub fn send(&self, event: InputEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("input queue full, dropping {event:?}");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn press(&self, button: Button) -> bool {
        self.send(InputEvent::Press(button))
    }

    pub fn release(&self, button: Button) -> bool {
        self.send(InputEvent::Release(button))
    }
}

#[derive(Debug)]
pub struct InputQueue {
    tx: Sender<InputEvent>,
    rx: Receiver<InputEvent>,
}

impl InputQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(INPUT_QUEUE_DEPTH);
        Self { tx, rx }
    }

    pub fn sender(&self) -> InputSender {
        InputSender {
            tx: self.tx.clone(),
        }
    }

    /// Apply every queued event. Returns whether anything changed.
    pub fn drain_into(&self, keypad: &mut Keypad) -> bool {
        let mut changed = false;
        while let Ok(event) = self.rx.try_recv() {
            keypad.apply(event);
            changed = true;
        }
        changed
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyinput_is_active_low() {
        let mut pad = Keypad::new();
        assert_eq!(pad.keyinput(), 0x03FF);
        pad.press(Button::Start);
        assert_eq!(pad.keyinput(), 0x03FF & !0x0008);
    }

    #[test]
    fn press_release_is_idempotent() {
        let mut pad = Keypad::new();
        let before = pad;
        pad.press(Button::L);
        pad.press(Button::L);
        pad.release(Button::L);
        pad.release(Button::L);
        assert_eq!(pad, before);
    }

    #[test]
    fn keycnt_and_or_conditions() {
        let mut pad = Keypad::new();
        pad.write_keycnt(KEYCNT_IRQ_ENABLE | Button::A.mask() | Button::B.mask());
        pad.press(Button::A);
        assert!(pad.irq_condition());

        pad.write_keycnt(
            KEYCNT_IRQ_ENABLE | KEYCNT_AND_MODE | Button::A.mask() | Button::B.mask(),
        );
        assert!(!pad.irq_condition());
        pad.press(Button::B);
        assert!(pad.irq_condition());
    }

    #[test]
    fn queued_events_apply_in_order() {
        let queue = InputQueue::new();
        let sender = queue.sender();
        let worker = std::thread::spawn(move || {
            sender.press(Button::Up);
            sender.press(Button::A);
            sender.release(Button::Up);
        });
        worker.join().expect("sender thread panicked");

        let mut pad = Keypad::new();
        assert!(queue.drain_into(&mut pad));
        assert!(pad.is_pressed(Button::A));
        assert!(!pad.is_pressed(Button::Up));
        assert!(!queue.drain_into(&mut pad));
    }
}
