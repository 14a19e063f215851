//! Scripted button presses for headless runs: `start@30` holds Start for
//! frame 30, `a@10..20` holds A for frames 10 through 19.

use std::str::FromStr;

use thiserror::Error;
use vibe_gba_core::Button;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPress {
    pub button: Button,
    pub start: u64,
    /// First frame the button is released again.
    pub end: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PressParseError {
    #[error("expected BUTTON@FRAME or BUTTON@START..END, got {0:?}")]
    Syntax(String),
    #[error("unknown button {0:?}")]
    UnknownButton(String),
    #[error("bad frame number {0:?}")]
    BadFrame(String),
    #[error("empty frame range {start}..{end}")]
    EmptyRange { start: u64, end: u64 },
}

fn frame(text: &str) -> Result<u64, PressParseError> {
    text.trim()
        .parse()
        .map_err(|_| PressParseError::BadFrame(text.to_string()))
}

impl FromStr for ButtonPress {
    type Err = PressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, frames) = s
            .split_once('@')
            .ok_or_else(|| PressParseError::Syntax(s.to_string()))?;
        let button = Button::from_name(name.trim())
            .ok_or_else(|| PressParseError::UnknownButton(name.to_string()))?;
        let (start, end) = match frames.split_once("..") {
            Some((start, end)) => (frame(start)?, frame(end)?),
            None => {
                let at = frame(frames)?;
                (at, at + 1)
            }
        };
        if end <= start {
            return Err(PressParseError::EmptyRange { start, end });
        }
        Ok(Self { button, start, end })
    }
}

/// What to do with the keypad before running frame `frame`.
pub fn edges(presses: &[ButtonPress], frame: u64) -> (Vec<Button>, Vec<Button>) {
    let released = presses
        .iter()
        .filter(|p| p.end == frame)
        .map(|p| p.button)
        .collect();
    let pressed = presses
        .iter()
        .filter(|p| p.start == frame)
        .map(|p| p.button)
        .collect();
    (pressed, released)
}
