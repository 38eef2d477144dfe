// Keyboard as the primary controller
//
// W/S = left stick Y, I/K = right stick Y, J/L = right stick X
// Y = mode, X = clamp, Q/A = L1/L2 (arm), E/D = R1/R2 (needle/batch)
// Arrows = d-pad, Esc or Ctrl-C = end teleop
//
// Terminals only report presses and auto-repeats, so a key counts as held
// until no event for it has arrived within its hold window. Button windows
// outlast the auto-repeat delay so one hold is one press.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{info, warn};

use super::{Button, Buttons, ControllerInput, ControllerState};
use crate::error::Result;

const AXIS_HOLD_TIMEOUT: Duration = Duration::from_millis(150);
const BUTTON_HOLD_TIMEOUT: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Binding {
    Axis { stick: Stick, value: i8 },
    Button(Button),
}

impl Binding {
    fn hold_timeout(self) -> Duration {
        match self {
            Binding::Axis { .. } => AXIS_HOLD_TIMEOUT,
            Binding::Button(_) => BUTTON_HOLD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stick {
    LeftY,
    RightX,
    RightY,
}

fn binding(code: KeyCode) -> Option<Binding> {
    let axis = |stick, value| Some(Binding::Axis { stick, value });
    match code {
        KeyCode::Char('w') => axis(Stick::LeftY, 1),
        KeyCode::Char('s') => axis(Stick::LeftY, -1),
        KeyCode::Char('i') => axis(Stick::RightY, 1),
        KeyCode::Char('k') => axis(Stick::RightY, -1),
        KeyCode::Char('l') => axis(Stick::RightX, 1),
        KeyCode::Char('j') => axis(Stick::RightX, -1),
        KeyCode::Char('y') => Some(Binding::Button(Button::Y)),
        KeyCode::Char('x') => Some(Binding::Button(Button::X)),
        KeyCode::Char('b') => Some(Binding::Button(Button::B)),
        KeyCode::Char('f') => Some(Binding::Button(Button::A)),
        KeyCode::Char('q') => Some(Binding::Button(Button::L1)),
        KeyCode::Char('a') => Some(Binding::Button(Button::L2)),
        KeyCode::Char('e') => Some(Binding::Button(Button::R1)),
        KeyCode::Char('d') => Some(Binding::Button(Button::R2)),
        KeyCode::Up => Some(Binding::Button(Button::Up)),
        KeyCode::Down => Some(Binding::Button(Button::Down)),
        KeyCode::Left => Some(Binding::Button(Button::Left)),
        KeyCode::Right => Some(Binding::Button(Button::Right)),
        _ => None,
    }
}

/// Fold held bindings into a controller state
fn compose(held: impl Iterator<Item = Binding>) -> ControllerState {
    let mut state = ControllerState::default();
    for b in held {
        match b {
            Binding::Axis { stick, value } => {
                let axis = match stick {
                    Stick::LeftY => &mut state.left_y,
                    Stick::RightX => &mut state.right_x,
                    Stick::RightY => &mut state.right_y,
                };
                *axis = (*axis + f64::from(value)).clamp(-1.0, 1.0);
            }
            Binding::Button(button) => state.buttons.insert(button),
        }
    }
    state
}

/// Raw-mode terminal keyboard. Raw mode is restored on drop.
pub struct KeyboardController {
    last_seen: HashMap<Binding, Instant>,
    ended: bool,
}

impl KeyboardController {
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        info!("Keyboard: W/S I/K J/L sticks, Y mode, X clamp, Q/A arm, E needle, D batch, Esc quit");
        Ok(Self {
            last_seen: HashMap::new(),
            ended: false,
        })
    }

    fn on_key(&mut self, key: KeyEvent, now: Instant) {
        if key.kind == KeyEventKind::Release {
            if let Some(b) = binding(key.code) {
                self.last_seen.remove(&b);
            }
            return;
        }
        let quit = key.code == KeyCode::Esc
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
        if quit {
            info!("Keyboard input ended");
            self.ended = true;
            return;
        }
        if let Some(b) = binding(key.code) {
            self.last_seen.insert(b, now);
        }
    }

    /// Bindings still inside their hold window at `now`
    fn held(&mut self, now: Instant) -> ControllerState {
        self.last_seen
            .retain(|b, seen| now.saturating_duration_since(*seen) <= b.hold_timeout());
        compose(self.last_seen.keys().copied())
    }
}

impl ControllerInput for KeyboardController {
    fn state(&mut self) -> Result<Option<ControllerState>> {
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                self.on_key(key, Instant::now());
            }
        }
        if self.ended {
            return Ok(None);
        }
        Ok(Some(self.held(Instant::now())))
    }

    fn rumble(&mut self, pattern: &str) {
        info!("Rumble {}", pattern);
    }
}

impl Drop for KeyboardController {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}
