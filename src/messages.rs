// Message and shared-state types passed between tasks
//
// Everything here is Copy so a consumer can take a full snapshot out of a
// watch channel in one borrow.

use serde::{Deserialize, Serialize};

/// Estimated field position. Heading is in degrees, clockwise positive,
/// 0 pointing along +y. It is not wrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    /// Signed distance travelled from `start` along the direction `start` was facing
    pub fn progress_from(&self, start: &Pose) -> f64 {
        let h = start.heading.to_radians();
        (self.x - start.x) * h.sin() + (self.y - start.y) * h.cos()
    }
}

/// Wrap an angle in degrees into (-180, 180]
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 { wrapped - 360.0 } else { wrapped }
}

/// Latest raw sensor readings, published by the sensor task
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Vertical (forward) tracking wheel, degrees
    pub vertical_deg: f64,
    /// Side tracking wheel, degrees
    pub side_deg: f64,
    /// IMU rotation, degrees, unwrapped
    pub rotation_deg: f64,
    /// Arm potentiometer, raw ADC units
    pub arm_pot: f64,
    pub stale: StaleFlags,
}

/// Which sensors failed their most recent read
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StaleFlags {
    pub vertical: bool,
    pub side: bool,
    pub imu: bool,
    pub arm_pot: bool,
}

impl StaleFlags {
    pub fn any(&self) -> bool {
        self.vertical || self.side || self.imu || self.arm_pot
    }
}

/// Motion command for the follower task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MotionCommand {
    /// Drive straight, inches. Negative drives backwards.
    Move { distance: f64 },
    /// Turn to an absolute heading, degrees, settling within `tolerance` degrees
    Turn { heading: f64, tolerance: f64 },
}

impl MotionCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            MotionCommand::Move { .. } => CommandKind::Move,
            MotionCommand::Turn { .. } => CommandKind::Turn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Move,
    Turn,
}

/// Mailbox written by the sequencer side. `command` is None when idle or
/// after a command was abandoned.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandSlot {
    pub id: u64,
    pub command: Option<MotionCommand>,
}

/// Completion flag written by the follower, keyed by the command it refers to
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Completion {
    pub id: u64,
    pub done: bool,
}

/// Follower output masks and speed cap
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FollowerSettings {
    pub forward_enabled: bool,
    pub rotate_enabled: bool,
    /// Output magnitude cap, 0.0..=1.0
    pub max_speed: f64,
}

impl Default for FollowerSettings {
    fn default() -> Self {
        Self {
            forward_enabled: false,
            rotate_enabled: false,
            max_speed: 1.0,
        }
    }
}

/// Arm control state, written only by the arm task
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    pub current_level: usize,
    pub target_level: usize,
    pub clamp_engaged: bool,
    /// Last measured potentiometer value
    pub position: f64,
}

/// Pneumatic actuator outputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorState {
    pub needle_engaged: bool,
    pub batch_engaged: bool,
}

/// Per-side drivetrain power, -1.0..=1.0
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub left: f64,
    pub right: f64,
}

impl DriveCommand {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn stop() -> Self {
        Self::default()
    }
}

/// Haptic feedback request for the operator's controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rumble {
    /// Triple pulse on entering automatic arm leveling
    ModeEntry,
    /// Periodic reminder while automatic leveling stays on
    Reminder,
}

impl Rumble {
    /// Pattern string in the controller's dot/dash notation
    pub fn pattern(&self) -> &'static str {
        match self {
            Rumble::ModeEntry => "...",
            Rumble::Reminder => ".",
        }
    }
}

/// Health status published alongside telemetry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    SensorStale,
}

impl From<&SensorSnapshot> for RuntimeHealth {
    fn from(snapshot: &SensorSnapshot) -> Self {
        if snapshot.stale.any() {
            RuntimeHealth::SensorStale
        } else {
            RuntimeHealth::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_degrees() {
        assert_eq!(wrap_degrees(0.0), 0.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert!((wrap_degrees(270.0) - -90.0).abs() < 1e-9);
        assert!((wrap_degrees(-450.0) - -90.0).abs() < 1e-9);
    }

    #[test]
    fn test_progress_follows_start_heading() {
        // Facing +x (heading 90), moving 5 inches along +x is forward progress
        let start = Pose::new(1.0, 1.0, 90.0);
        let now = Pose::new(6.0, 1.0, 90.0);
        assert!((now.progress_from(&start) - 5.0).abs() < 1e-9);

        // Backing up gives negative progress
        let back = Pose::new(-4.0, 1.0, 90.0);
        assert!((back.progress_from(&start) + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_from_snapshot() {
        let mut snapshot = SensorSnapshot::default();
        assert_eq!(RuntimeHealth::from(&snapshot), RuntimeHealth::Ok);
        snapshot.stale.imu = true;
        assert_eq!(RuntimeHealth::from(&snapshot), RuntimeHealth::SensorStale);
    }

    #[test]
    fn test_health_serializes_snake_case() {
        let json = serde_json::to_string(&RuntimeHealth::SensorStale).unwrap();
        assert_eq!(json, "\"sensor_stale\"");
    }
}
