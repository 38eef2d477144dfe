// Simulated robot: differential base, tracking wheels, IMU, arm and pneumatics
//
// The world is advanced lazily to tokio's clock on every device access, so it
// needs no task of its own and follows the paused clock in tests.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use super::{
    AnalogIn, BrakeMode, DeviceBackend, DeviceResult, DigitalOut, Inertial, Motor, MotorConfig,
    RotationSensor,
};
use crate::config::{PortMap, RobotConfig, SimConfig};
use crate::error::DeviceError;

/// Drive wheel diameter used to turn travelled inches into motor degrees
const DRIVE_WHEEL_DIAMETER_IN: f64 = 3.25;
/// Potentiometer range
const POT_MIN: f64 = 0.0;
const POT_MAX: f64 = 4095.0;
/// Arm motor degrees per potentiometer unit
const ARM_DEG_PER_POT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Smart,
    Adi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotorRole {
    DriveLeft,
    DriveRight,
    Arm,
}

struct SimState {
    last: Instant,
    sim: SimConfig,
    track_width: f64,
    tracker_diameter: f64,

    motor_power: HashMap<u8, f64>,
    motor_role: HashMap<u8, MotorRole>,
    brake_mode: HashMap<u8, BrakeMode>,
    digital: HashMap<u8, bool>,
    disconnected: HashSet<(PortKind, u8)>,
    stall_rotation: bool,
    stall_translation: bool,

    // Ground truth
    x: f64,
    y: f64,
    heading_rad: f64,
    left_in: f64,
    right_in: f64,
    center_in: f64,
    left_ips: f64,
    right_ips: f64,
    arm_pot: f64,

    // Sensor zero points (set by reset)
    imu_zero_deg: f64,
    tracker_zero_deg: HashMap<u8, f64>,
}

impl SimState {
    fn side_power(&self, role: MotorRole) -> f64 {
        let powers: Vec<f64> = self
            .motor_role
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(port, _)| self.motor_power.get(port).copied().unwrap_or(0.0))
            .collect();
        if powers.is_empty() {
            0.0
        } else {
            powers.iter().sum::<f64>() / powers.len() as f64
        }
    }

    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        if dt <= 0.0 {
            return;
        }

        let vl = self.side_power(MotorRole::DriveLeft) * self.sim.drive_max_ips;
        let vr = self.side_power(MotorRole::DriveRight) * self.sim.drive_max_ips;
        let mut v = (vl + vr) / 2.0;
        let mut half_diff = (vl - vr) / 2.0;
        if self.stall_translation {
            v = 0.0;
        }
        if self.stall_rotation {
            half_diff = 0.0;
        }
        self.left_ips = v + half_diff;
        self.right_ips = v - half_diff;

        let omega = 2.0 * half_diff / self.track_width;
        let mid_heading = self.heading_rad + omega * dt / 2.0;
        self.heading_rad += omega * dt;
        self.x += v * mid_heading.sin() * dt;
        self.y += v * mid_heading.cos() * dt;
        self.left_in += self.left_ips * dt;
        self.right_in += self.right_ips * dt;
        self.center_in += v * dt;

        let arm_power = self.side_power(MotorRole::Arm);
        self.arm_pot =
            (self.arm_pot + arm_power * self.sim.arm_units_per_sec * dt).clamp(POT_MIN, POT_MAX);
    }

    fn check(&self, kind: PortKind, port: u8) -> DeviceResult<()> {
        if self.disconnected.contains(&(kind, port)) {
            Err(DeviceError::Disconnected { port })
        } else {
            Ok(())
        }
    }

    fn tracker_raw_deg(&self, port: u8, side: bool) -> f64 {
        // Only the vertical wheel sees motion on a differential base
        let inches = if side { 0.0 } else { self.center_in };
        let raw = inches / (PI * self.tracker_diameter) * 360.0;
        raw - self.tracker_zero_deg.get(&port).copied().unwrap_or(0.0)
    }
}

/// Shared handle to the simulated world
#[derive(Clone)]
pub struct SimWorld {
    state: Arc<Mutex<SimState>>,
}

impl SimWorld {
    pub fn new(config: &RobotConfig) -> Self {
        let state = SimState {
            last: Instant::now(),
            sim: config.sim.clone(),
            track_width: config.geometry.track_width,
            tracker_diameter: config.geometry.tracking_wheel_diameter,
            motor_power: HashMap::new(),
            motor_role: HashMap::new(),
            brake_mode: HashMap::new(),
            digital: HashMap::new(),
            disconnected: HashSet::new(),
            stall_rotation: false,
            stall_translation: false,
            x: 0.0,
            y: 0.0,
            heading_rad: 0.0,
            left_in: 0.0,
            right_in: 0.0,
            center_in: 0.0,
            left_ips: 0.0,
            right_ips: 0.0,
            arm_pot: config.sim.arm_start,
            imu_zero_deg: 0.0,
            tracker_zero_deg: HashMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.advance(Instant::now());
        state
    }

    /// Make every read and write on a port fail until reconnected
    pub fn disconnect(&self, kind: PortKind, port: u8) {
        self.lock().disconnected.insert((kind, port));
    }

    pub fn reconnect(&self, kind: PortKind, port: u8) {
        self.lock().disconnected.remove(&(kind, port));
    }

    /// Base can no longer change heading (turns never converge)
    pub fn set_rotation_stall(&self, stalled: bool) {
        self.lock().stall_rotation = stalled;
    }

    /// Base can no longer translate (moves never converge)
    pub fn set_translation_stall(&self, stalled: bool) {
        self.lock().stall_translation = stalled;
    }

    /// Last power commanded to a motor port
    pub fn motor_power(&self, port: u8) -> Option<f64> {
        self.lock().motor_power.get(&port).copied()
    }

    /// Last brake mode set on a motor port
    pub fn brake_mode(&self, port: u8) -> Option<BrakeMode> {
        self.lock().brake_mode.get(&port).copied()
    }

    /// Last value written to an ADI digital output
    pub fn digital(&self, port: u8) -> Option<bool> {
        self.lock().digital.get(&port).copied()
    }

    /// Ground-truth heading, degrees, clockwise positive
    pub fn true_heading(&self) -> f64 {
        self.lock().heading_rad.to_degrees()
    }

    /// Ground-truth distance travelled by the robot centre, inches
    pub fn true_travel(&self) -> f64 {
        self.lock().center_in
    }

    pub fn arm_pot(&self) -> f64 {
        self.lock().arm_pot
    }
}

/// Opens simulated devices, assigning motor roles from the port map
pub struct SimBackend {
    world: SimWorld,
    side_tracker: u8,
}

impl SimBackend {
    pub fn new(world: SimWorld, ports: &PortMap) -> Self {
        {
            let mut state = world.lock();
            for m in &ports.drive_left {
                state.motor_role.insert(m.port, MotorRole::DriveLeft);
            }
            for m in &ports.drive_right {
                state.motor_role.insert(m.port, MotorRole::DriveRight);
            }
            for m in &ports.arm {
                state.motor_role.insert(m.port, MotorRole::Arm);
            }
        }
        Self {
            world,
            side_tracker: ports.tracker_side,
        }
    }
}

impl DeviceBackend for SimBackend {
    fn motor(&self, config: &MotorConfig) -> DeviceResult<Box<dyn Motor>> {
        let role = self
            .world
            .lock()
            .motor_role
            .get(&config.port)
            .copied()
            .ok_or(DeviceError::InvalidPort {
                port: config.port,
                kind: "motor",
            })?;
        Ok(Box::new(SimMotor {
            world: self.world.clone(),
            config: *config,
            role,
        }))
    }

    fn rotation(&self, port: u8) -> DeviceResult<Box<dyn RotationSensor>> {
        Ok(Box::new(SimRotation {
            world: self.world.clone(),
            port,
            side: port == self.side_tracker,
        }))
    }

    fn inertial(&self, port: u8) -> DeviceResult<Box<dyn Inertial>> {
        Ok(Box::new(SimImu {
            world: self.world.clone(),
            port,
        }))
    }

    fn analog_in(&self, port: u8) -> DeviceResult<Box<dyn AnalogIn>> {
        Ok(Box::new(SimPot {
            world: self.world.clone(),
            port,
        }))
    }

    fn digital_out(&self, port: u8) -> DeviceResult<Box<dyn DigitalOut>> {
        Ok(Box::new(SimDigitalOut {
            world: self.world.clone(),
            port,
        }))
    }
}

struct SimMotor {
    world: SimWorld,
    config: MotorConfig,
    role: MotorRole,
}

impl Motor for SimMotor {
    fn port(&self) -> u8 {
        self.config.port
    }

    fn position(&self) -> DeviceResult<f64> {
        let state = self.world.lock();
        state.check(PortKind::Smart, self.config.port)?;
        let degrees = match self.role {
            MotorRole::DriveLeft => state.left_in / (PI * DRIVE_WHEEL_DIAMETER_IN) * 360.0,
            MotorRole::DriveRight => state.right_in / (PI * DRIVE_WHEEL_DIAMETER_IN) * 360.0,
            MotorRole::Arm => state.arm_pot * ARM_DEG_PER_POT,
        };
        Ok(self.config.units.from_degrees(degrees, self.config.gearset))
    }

    fn velocity(&self) -> DeviceResult<f64> {
        let state = self.world.lock();
        state.check(PortKind::Smart, self.config.port)?;
        let rpm = match self.role {
            MotorRole::DriveLeft => state.left_ips / (PI * DRIVE_WHEEL_DIAMETER_IN) * 60.0,
            MotorRole::DriveRight => state.right_ips / (PI * DRIVE_WHEEL_DIAMETER_IN) * 60.0,
            MotorRole::Arm => state.side_power(MotorRole::Arm) * self.config.gearset.max_rpm(),
        };
        Ok(rpm)
    }

    fn set_power(&mut self, power: f64) -> DeviceResult<()> {
        let mut state = self.world.lock();
        state.check(PortKind::Smart, self.config.port)?;
        state
            .motor_power
            .insert(self.config.port, power.clamp(-1.0, 1.0));
        Ok(())
    }

    fn set_brake_mode(&mut self, mode: BrakeMode) -> DeviceResult<()> {
        let mut state = self.world.lock();
        state.check(PortKind::Smart, self.config.port)?;
        state.brake_mode.insert(self.config.port, mode);
        Ok(())
    }
}

struct SimRotation {
    world: SimWorld,
    port: u8,
    side: bool,
}

impl RotationSensor for SimRotation {
    fn position(&self) -> DeviceResult<f64> {
        let state = self.world.lock();
        state.check(PortKind::Smart, self.port)?;
        Ok(state.tracker_raw_deg(self.port, self.side))
    }

    fn reset_position(&mut self) -> DeviceResult<()> {
        let mut state = self.world.lock();
        state.check(PortKind::Smart, self.port)?;
        let current = state.tracker_raw_deg(self.port, self.side);
        *state.tracker_zero_deg.entry(self.port).or_insert(0.0) += current;
        Ok(())
    }
}

struct SimImu {
    world: SimWorld,
    port: u8,
}

impl Inertial for SimImu {
    fn rotation(&self) -> DeviceResult<f64> {
        let state = self.world.lock();
        state.check(PortKind::Smart, self.port)?;
        Ok(state.heading_rad.to_degrees() - state.imu_zero_deg)
    }

    fn reset(&mut self) -> DeviceResult<()> {
        let mut state = self.world.lock();
        state.check(PortKind::Smart, self.port)?;
        state.imu_zero_deg = state.heading_rad.to_degrees();
        Ok(())
    }
}

struct SimPot {
    world: SimWorld,
    port: u8,
}

impl AnalogIn for SimPot {
    fn value(&self) -> DeviceResult<f64> {
        let state = self.world.lock();
        state.check(PortKind::Adi, self.port)?;
        Ok(state.arm_pot)
    }
}

struct SimDigitalOut {
    world: SimWorld,
    port: u8,
}

impl DigitalOut for SimDigitalOut {
    fn set(&mut self, value: bool) -> DeviceResult<()> {
        let mut state = self.world.lock();
        state.check(PortKind::Adi, self.port)?;
        state.digital.insert(self.port, value);
        Ok(())
    }
}
