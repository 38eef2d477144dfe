// Stick-to-drivetrain mixing

use serde::{Deserialize, Serialize};

use crate::input::ControllerState;
use crate::messages::DriveCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriveMode {
    /// Left stick Y drives the left side, right stick Y the right side
    #[default]
    Tank,
    /// Left stick Y is power, right stick X is turn
    Arcade,
}

impl DriveMode {
    pub fn toggled(self) -> Self {
        match self {
            DriveMode::Tank => DriveMode::Arcade,
            DriveMode::Arcade => DriveMode::Tank,
        }
    }

    pub fn mix(self, input: &ControllerState) -> DriveCommand {
        match self {
            DriveMode::Tank => tank(input.left_y, input.right_y),
            DriveMode::Arcade => arcade(input.left_y, input.right_x),
        }
    }
}

pub fn tank(left: f64, right: f64) -> DriveCommand {
    DriveCommand::new(left, right)
}

/// Power plus/minus turn. Outputs are not normalized; motor groups clamp.
pub fn arcade(power: f64, turn: f64) -> DriveCommand {
    DriveCommand::new(power + turn, power - turn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tank_passes_axes_through() {
        assert_eq!(tank(1.0, -1.0), DriveCommand::new(1.0, -1.0));
    }

    #[test]
    fn test_arcade_sums_power_and_turn() {
        let cmd = arcade(0.5, 0.3);
        assert!((cmd.left - 0.8).abs() < 1e-12);
        assert!((cmd.right - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_mode_selects_axes() {
        let input = ControllerState {
            left_y: 0.5,
            right_x: 0.3,
            right_y: -0.4,
            ..Default::default()
        };
        assert_eq!(DriveMode::Tank.mix(&input), DriveCommand::new(0.5, -0.4));
        assert_eq!(DriveMode::Tank.toggled(), DriveMode::Arcade);
        let arcade = DriveMode::Arcade.mix(&input);
        assert!((arcade.left - 0.8).abs() < 1e-12);
        assert!((arcade.right - 0.2).abs() < 1e-12);
    }
}
