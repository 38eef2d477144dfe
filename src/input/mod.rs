// Operator controller sources
//
// The teleop loop reads each controller once per tick through the
// ControllerInput trait. Sources here are pure input; edge detection happens
// in the teleop layer so it can be tested without hardware.

pub mod keyboard;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use keyboard::KeyboardController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    A,
    B,
    X,
    Y,
    L1,
    L2,
    R1,
    R2,
    Up,
    Down,
    Left,
    Right,
}

impl Button {
    pub const ALL: [Button; 12] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::L1,
        Button::L2,
        Button::R1,
        Button::R2,
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
    ];

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// Set of buttons held down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buttons(u16);

impl Buttons {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, button: Button) -> Self {
        self.insert(button);
        self
    }

    pub fn insert(&mut self, button: Button) {
        self.0 |= button.bit();
    }

    pub fn contains(&self, button: Button) -> bool {
        self.0 & button.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Buttons in `self` that are not in `other`
    pub fn difference(&self, other: &Buttons) -> Buttons {
        Buttons(self.0 & !other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL.into_iter().filter(|b| self.contains(*b))
    }
}

impl FromIterator<Button> for Buttons {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        let mut buttons = Buttons::empty();
        for b in iter {
            buttons.insert(b);
        }
        buttons
    }
}

/// One reading of a controller. Axes are normalized to -1.0..=1.0, forward
/// and right positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub left_x: f64,
    pub left_y: f64,
    pub right_x: f64,
    pub right_y: f64,
    pub buttons: Buttons,
}

impl ControllerState {
    pub fn pressed(&self, button: Button) -> bool {
        self.buttons.contains(button)
    }
}

pub trait ControllerInput: Send {
    /// Current state, or None once the source has ended
    fn state(&mut self) -> Result<Option<ControllerState>>;

    /// Haptic pulse; `pattern` uses '.' short and '-' long
    fn rumble(&mut self, pattern: &str);
}

/// A controller nobody is holding
#[derive(Debug, Default)]
pub struct IdleController;

impl ControllerInput for IdleController {
    fn state(&mut self) -> Result<Option<ControllerState>> {
        Ok(Some(ControllerState::default()))
    }

    fn rumble(&mut self, _pattern: &str) {}
}

/// Plays back a fixed list of states, one per read, then ends
#[derive(Debug, Default)]
pub struct ScriptedController {
    states: VecDeque<ControllerState>,
    rumbles: Vec<String>,
}

impl ScriptedController {
    /// Hold `state` for `ticks` reads
    pub fn hold(mut self, state: ControllerState, ticks: usize) -> Self {
        self.states.extend(std::iter::repeat_n(state, ticks));
        self
    }

    pub fn remaining(&self) -> usize {
        self.states.len()
    }

    /// Rumble patterns received so far
    pub fn rumbles(&self) -> &[String] {
        &self.rumbles
    }
}

impl ControllerInput for ScriptedController {
    fn state(&mut self) -> Result<Option<ControllerState>> {
        Ok(self.states.pop_front())
    }

    fn rumble(&mut self, pattern: &str) {
        self.rumbles.push(pattern.to_string());
    }
}
