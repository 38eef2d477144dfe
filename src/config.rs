// Loop periods, timeouts, geometry, gains, port map and telemetry topics
//
// The constants are the defaults. RobotConfig bundles them so a JSON file can
// override any of them at startup (see RobotConfig::load).
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::devices::{EncoderUnits, Gearset, MotorConfig};
use crate::error::{Result, RobotError};

// Task periods
pub const SENSOR_PERIOD_MS: u64 = 10;
pub const ODOMETRY_PERIOD_MS: u64 = 10;
pub const FOLLOWER_PERIOD_MS: u64 = 10;
pub const ARM_PERIOD_MS: u64 = 10;
pub const TELEOP_PERIOD_MS: u64 = 5;

// Competition phase lengths
pub const AUTON_DURATION: Duration = Duration::from_secs(15);
pub const TELEOP_DURATION: Duration = Duration::from_secs(105);

// Follower tolerances
pub const DEFAULT_TURN_TOLERANCE_DEG: f64 = 1.0;
pub const MOVE_TOLERANCE_IN: f64 = 0.5;

// Follower gains (power per inch / per degree of error)
pub const MOVE_KP: f64 = 0.15;
pub const TURN_KP: f64 = 0.02;
pub const HEADING_HOLD_KP: f64 = 0.01;
// Smallest non-zero output, so the base does not creep to a stop outside tolerance
pub const MIN_OUTPUT: f64 = 0.08;

// Geometry (inches)
pub const TRACK_WIDTH_IN: f64 = 12.0;
pub const TRACKING_WHEEL_DIAMETER_IN: f64 = 2.0;
pub const VERTICAL_TRACKER_OFFSET_IN: f64 = 0.0;
pub const SIDE_TRACKER_OFFSET_IN: f64 = 0.0;

// Arm: potentiometer targets for Stowed, Carry, Score
pub const ARM_LEVELS: [f64; 3] = [450.0, 1350.0, 2600.0];
pub const ARM_KP: f64 = 0.004;
pub const ARM_NUDGE_POWER: f64 = 0.6;
pub const ARM_NUDGE_TICKS: u32 = 15;
// Operator reminder cadence while automatic leveling is on
pub const ARM_START_ENGAGED: bool = true;
pub const RUMBLE_INTERVAL: Duration = Duration::from_millis(2500);

// Zenoh topics
pub const TOPIC_POSE: &str = "robot/state/pose";
pub const TOPIC_ARM: &str = "robot/state/arm";
pub const TOPIC_ACTUATORS: &str = "robot/state/actuators";
pub const TOPIC_HEALTH: &str = "robot/state/health";
pub const TELEMETRY_HZ: u64 = 20;

// Simulated hardware response
pub const SIM_DRIVE_MAX_IPS: f64 = 60.0;
pub const SIM_ARM_UNITS_PER_SEC: f64 = 2000.0;

/// Construct-time port assignments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMap {
    pub drive_left: [MotorConfig; 3],
    pub drive_right: [MotorConfig; 3],
    pub arm: [MotorConfig; 2],
    /// Smart ports
    pub tracker_vertical: u8,
    pub tracker_side: u8,
    pub imu: u8,
    /// ADI ports (1 = A .. 8 = H)
    pub clamp: u8,
    pub batch: u8,
    pub needle: u8,
    pub arm_pot: u8,
}

impl Default for PortMap {
    fn default() -> Self {
        let drive = |port, reversed| MotorConfig {
            port,
            gearset: Gearset::Blue,
            reversed,
            units: EncoderUnits::Degrees,
        };
        let arm = |port, reversed| MotorConfig {
            port,
            gearset: Gearset::Red,
            reversed,
            units: EncoderUnits::Degrees,
        };
        Self {
            drive_left: [drive(1, true), drive(2, false), drive(3, true)],
            drive_right: [drive(4, false), drive(5, true), drive(6, false)],
            arm: [arm(7, true), arm(8, false)],
            tracker_vertical: 9,
            tracker_side: 10,
            imu: 11,
            clamp: 1,
            batch: 2,
            needle: 3,
            arm_pot: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    pub track_width: f64,
    pub tracking_wheel_diameter: f64,
    pub vertical_offset: f64,
    pub side_offset: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            track_width: TRACK_WIDTH_IN,
            tracking_wheel_diameter: TRACKING_WHEEL_DIAMETER_IN,
            vertical_offset: VERTICAL_TRACKER_OFFSET_IN,
            side_offset: SIDE_TRACKER_OFFSET_IN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerGains {
    pub move_kp: f64,
    pub turn_kp: f64,
    pub heading_hold_kp: f64,
    pub min_output: f64,
    pub move_tolerance: f64,
    pub turn_tolerance: f64,
}

impl Default for FollowerGains {
    fn default() -> Self {
        Self {
            move_kp: MOVE_KP,
            turn_kp: TURN_KP,
            heading_hold_kp: HEADING_HOLD_KP,
            min_output: MIN_OUTPUT,
            move_tolerance: MOVE_TOLERANCE_IN,
            turn_tolerance: DEFAULT_TURN_TOLERANCE_DEG,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    /// Potentiometer target per level, ascending
    pub levels: Vec<f64>,
    pub kp: f64,
    pub nudge_power: f64,
    pub nudge_ticks: u32,
    pub rumble_interval_ms: u64,
    /// Boot in automatic leveling with the clamp closed
    pub start_engaged: bool,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            levels: ARM_LEVELS.to_vec(),
            kp: ARM_KP,
            nudge_power: ARM_NUDGE_POWER,
            nudge_ticks: ARM_NUDGE_TICKS,
            rumble_interval_ms: RUMBLE_INTERVAL.as_millis() as u64,
            start_engaged: ARM_START_ENGAGED,
        }
    }
}

/// Task periods in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPeriods {
    pub sensor_ms: u64,
    pub odometry_ms: u64,
    pub follower_ms: u64,
    pub arm_ms: u64,
    pub teleop_ms: u64,
}

impl Default for TaskPeriods {
    fn default() -> Self {
        Self {
            sensor_ms: SENSOR_PERIOD_MS,
            odometry_ms: ODOMETRY_PERIOD_MS,
            follower_ms: FOLLOWER_PERIOD_MS,
            arm_ms: ARM_PERIOD_MS,
            teleop_ms: TELEOP_PERIOD_MS,
        }
    }
}

impl TaskPeriods {
    pub fn sensor(&self) -> Duration {
        Duration::from_millis(self.sensor_ms)
    }

    pub fn odometry(&self) -> Duration {
        Duration::from_millis(self.odometry_ms)
    }

    pub fn follower(&self) -> Duration {
        Duration::from_millis(self.follower_ms)
    }

    pub fn arm(&self) -> Duration {
        Duration::from_millis(self.arm_ms)
    }

    pub fn teleop(&self) -> Duration {
        Duration::from_millis(self.teleop_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Base speed at full power, inches per second
    pub drive_max_ips: f64,
    /// Potentiometer change at full arm power, units per second
    pub arm_units_per_sec: f64,
    /// Potentiometer reading at power-on
    pub arm_start: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            drive_max_ips: SIM_DRIVE_MAX_IPS,
            arm_units_per_sec: SIM_ARM_UNITS_PER_SEC,
            arm_start: ARM_LEVELS[0],
        }
    }
}

/// Full runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub ports: PortMap,
    pub geometry: Geometry,
    pub follower: FollowerGains,
    pub arm: ArmConfig,
    pub periods: TaskPeriods,
    pub sim: SimConfig,
}

impl RobotConfig {
    /// Load a JSON config file. Missing fields fall back to the defaults above.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: RobotConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let levels = &self.arm.levels;
        if levels.is_empty() {
            return Err(RobotError::Config("arm.levels must not be empty".into()));
        }
        if levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RobotError::Config(
                "arm.levels must be strictly ascending".into(),
            ));
        }
        if self.geometry.track_width <= 0.0 || self.geometry.tracking_wheel_diameter <= 0.0 {
            return Err(RobotError::Config("geometry must be positive".into()));
        }
        if self.follower.move_tolerance <= 0.0 || self.follower.turn_tolerance <= 0.0 {
            return Err(RobotError::Config("tolerances must be positive".into()));
        }
        let p = &self.periods;
        if [p.sensor_ms, p.odometry_ms, p.follower_ms, p.arm_ms, p.teleop_ms].contains(&0) {
            return Err(RobotError::Config("task periods must be non-zero".into()));
        }
        Ok(())
    }
}
