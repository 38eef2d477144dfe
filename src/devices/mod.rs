// Device boundary for the robot
//
// Provides:
// - Traits for the handful of device capabilities the control core needs
// - Motor groups that mirror one command to several motors
// - DeviceRegistry, which opens every device once from a port map
// - A simulated backend (sim) used by tests and by the binary when no hardware is attached

pub mod sim;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PortMap;
use crate::error::DeviceError;
use crate::messages::DriveCommand;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Valid smart port range
pub const SMART_PORTS: std::ops::RangeInclusive<u8> = 1..=21;
/// Valid ADI (three-wire) port range, A..H
pub const ADI_PORTS: std::ops::RangeInclusive<u8> = 1..=8;

/// Motor cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gearset {
    /// 600 rpm
    Blue,
    /// 200 rpm
    Green,
    /// 100 rpm
    Red,
}

impl Gearset {
    pub fn max_rpm(&self) -> f64 {
        match self {
            Gearset::Blue => 600.0,
            Gearset::Green => 200.0,
            Gearset::Red => 100.0,
        }
    }

    /// Encoder counts per output shaft revolution
    pub fn counts_per_rev(&self) -> f64 {
        match self {
            Gearset::Blue => 300.0,
            Gearset::Green => 900.0,
            Gearset::Red => 1800.0,
        }
    }
}

/// Units motor positions are reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderUnits {
    Degrees,
    Rotations,
    Counts,
}

impl EncoderUnits {
    pub fn from_degrees(&self, degrees: f64, gearset: Gearset) -> f64 {
        match self {
            EncoderUnits::Degrees => degrees,
            EncoderUnits::Rotations => degrees / 360.0,
            EncoderUnits::Counts => degrees / 360.0 * gearset.counts_per_rev(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakeMode {
    Coast,
    Brake,
    Hold,
}

/// Construct-time parameters of one motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub port: u8,
    pub gearset: Gearset,
    pub reversed: bool,
    pub units: EncoderUnits,
}

pub trait Motor: Send {
    fn port(&self) -> u8;
    /// Shaft position in the configured units
    fn position(&self) -> DeviceResult<f64>;
    /// Shaft velocity, rpm
    fn velocity(&self) -> DeviceResult<f64>;
    /// Commanded power, clamped to -1.0..=1.0
    fn set_power(&mut self, power: f64) -> DeviceResult<()>;
    fn set_brake_mode(&mut self, mode: BrakeMode) -> DeviceResult<()>;
}

pub trait RotationSensor: Send {
    /// Accumulated rotation, degrees
    fn position(&self) -> DeviceResult<f64>;
    fn reset_position(&mut self) -> DeviceResult<()>;
}

pub trait Inertial: Send {
    /// Unwrapped rotation, degrees, clockwise positive
    fn rotation(&self) -> DeviceResult<f64>;
    fn reset(&mut self) -> DeviceResult<()>;
}

pub trait AnalogIn: Send {
    fn value(&self) -> DeviceResult<f64>;
}

pub trait DigitalOut: Send {
    fn set(&mut self, value: bool) -> DeviceResult<()>;
}

/// Something that can open devices on ports (real hardware or the simulator)
pub trait DeviceBackend {
    fn motor(&self, config: &MotorConfig) -> DeviceResult<Box<dyn Motor>>;
    fn rotation(&self, port: u8) -> DeviceResult<Box<dyn RotationSensor>>;
    fn inertial(&self, port: u8) -> DeviceResult<Box<dyn Inertial>>;
    fn analog_in(&self, port: u8) -> DeviceResult<Box<dyn AnalogIn>>;
    fn digital_out(&self, port: u8) -> DeviceResult<Box<dyn DigitalOut>>;
}

/// Several motors driven with one mirrored command
pub struct MotorGroup {
    name: &'static str,
    motors: Vec<Box<dyn Motor>>,
}

impl MotorGroup {
    pub fn new(name: &'static str, motors: Vec<Box<dyn Motor>>) -> Self {
        Self { name, motors }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    /// Send the same power to every motor. Every motor is attempted; the first
    /// failure is returned.
    pub fn set_power(&mut self, power: f64) -> DeviceResult<()> {
        let power = power.clamp(-1.0, 1.0);
        let mut first_err = None;
        for motor in &mut self.motors {
            if let Err(e) = motor.set_power(power) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Average position over the motors that answered
    pub fn position(&self) -> DeviceResult<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut last_err = None;
        for motor in &self.motors {
            match motor.position() {
                Ok(p) => {
                    sum += p;
                    count += 1;
                }
                Err(e) => last_err = Some(e),
            }
        }
        match (count, last_err) {
            (0, Some(e)) => Err(e),
            (0, None) => Ok(0.0),
            _ => Ok(sum / count as f64),
        }
    }

    pub fn set_brake_mode(&mut self, mode: BrakeMode) -> DeviceResult<()> {
        let mut first_err = None;
        for motor in &mut self.motors {
            if let Err(e) = motor.set_brake_mode(mode) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub type SharedMotorGroup = Arc<Mutex<MotorGroup>>;

/// Lock a shared group. A panicked writer leaves motor state intact, so a
/// poisoned lock is still usable.
pub fn lock_group(group: &SharedMotorGroup) -> MutexGuard<'_, MotorGroup> {
    group.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Three motors per side, shared between the follower (autonomous) and
/// the teleop loop. Only one of them drives at a time.
#[derive(Clone)]
pub struct Drivetrain {
    pub left: SharedMotorGroup,
    pub right: SharedMotorGroup,
}

impl Drivetrain {
    pub fn new(left: MotorGroup, right: MotorGroup) -> Self {
        Self {
            left: Arc::new(Mutex::new(left)),
            right: Arc::new(Mutex::new(right)),
        }
    }

    /// Apply a drive command, attempting both sides even if one fails
    pub fn apply(&self, cmd: DriveCommand) -> DeviceResult<()> {
        let left = lock_group(&self.left).set_power(cmd.left);
        let right = lock_group(&self.right).set_power(cmd.right);
        left.and(right)
    }

    pub fn stop(&self) -> DeviceResult<()> {
        self.apply(DriveCommand::stop())
    }

    pub fn set_brake_mode(&self, mode: BrakeMode) -> DeviceResult<()> {
        let left = lock_group(&self.left).set_brake_mode(mode);
        let right = lock_group(&self.right).set_brake_mode(mode);
        left.and(right)
    }
}

/// Sensors polled by the sensor task
pub struct SensorSet {
    pub tracker_vertical: Box<dyn RotationSensor>,
    pub tracker_side: Box<dyn RotationSensor>,
    pub imu: Box<dyn Inertial>,
    pub arm_pot: Box<dyn AnalogIn>,
}

/// Every device on the robot, opened once at startup. The lifecycle moves
/// each part into the task that owns it.
pub struct DeviceRegistry {
    pub drivetrain: Drivetrain,
    pub arm: MotorGroup,
    pub clamp: Box<dyn DigitalOut>,
    pub batch: Box<dyn DigitalOut>,
    pub needle: Box<dyn DigitalOut>,
    pub sensors: SensorSet,
}

impl DeviceRegistry {
    /// Open all devices in the port map and zero the tracking sensors
    pub fn open(backend: &dyn DeviceBackend, ports: &PortMap) -> DeviceResult<Self> {
        validate_ports(ports)?;
        info!("Opening devices");

        let open_group = |name, configs: &[MotorConfig]| -> DeviceResult<MotorGroup> {
            let motors = configs
                .iter()
                .map(|cfg| backend.motor(cfg))
                .collect::<DeviceResult<Vec<_>>>()?;
            let group = MotorGroup::new(name, motors);
            if group.is_empty() {
                warn!("Motor group '{}' has no motors", group.name());
            } else {
                debug!("Opened motor group '{}' ({} motors)", group.name(), group.len());
            }
            Ok(group)
        };

        let left = open_group("drive_left", &ports.drive_left)?;
        let right = open_group("drive_right", &ports.drive_right)?;
        let arm = open_group("arm", &ports.arm)?;

        let mut sensors = SensorSet {
            tracker_vertical: backend.rotation(ports.tracker_vertical)?,
            tracker_side: backend.rotation(ports.tracker_side)?,
            imu: backend.inertial(ports.imu)?,
            arm_pot: backend.analog_in(ports.arm_pot)?,
        };

        // A sensor that cannot be zeroed is degraded, not fatal
        if let Err(e) = sensors.tracker_vertical.reset_position() {
            warn!("Failed to reset vertical tracker: {}", e);
        }
        if let Err(e) = sensors.tracker_side.reset_position() {
            warn!("Failed to reset side tracker: {}", e);
        }
        if let Err(e) = sensors.imu.reset() {
            warn!("Failed to reset IMU: {}", e);
        }

        let registry = Self {
            drivetrain: Drivetrain::new(left, right),
            arm,
            clamp: backend.digital_out(ports.clamp)?,
            batch: backend.digital_out(ports.batch)?,
            needle: backend.digital_out(ports.needle)?,
            sensors,
        };
        info!("Devices opened");
        Ok(registry)
    }
}

fn validate_ports(ports: &PortMap) -> DeviceResult<()> {
    let mut smart = HashSet::new();
    let motor_ports = ports
        .drive_left
        .iter()
        .chain(&ports.drive_right)
        .chain(&ports.arm)
        .map(|m| m.port);
    let sensor_ports = [ports.tracker_vertical, ports.tracker_side, ports.imu];
    for port in motor_ports.chain(sensor_ports) {
        if !SMART_PORTS.contains(&port) {
            return Err(DeviceError::InvalidPort { port, kind: "smart" });
        }
        if !smart.insert(port) {
            return Err(DeviceError::PortInUse { port });
        }
    }

    let mut adi = HashSet::new();
    for port in [ports.clamp, ports.batch, ports.needle, ports.arm_pot] {
        if !ADI_PORTS.contains(&port) {
            return Err(DeviceError::InvalidPort { port, kind: "ADI" });
        }
        if !adi.insert(port) {
            return Err(DeviceError::PortInUse { port });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::devices::sim::{PortKind, SimBackend, SimWorld};

    fn sim() -> (SimWorld, SimBackend) {
        let config = RobotConfig::default();
        let world = SimWorld::new(&config);
        let backend = SimBackend::new(world.clone(), &config.ports);
        (world, backend)
    }

    #[test]
    fn test_encoder_units() {
        assert_eq!(EncoderUnits::Degrees.from_degrees(720.0, Gearset::Blue), 720.0);
        assert_eq!(EncoderUnits::Rotations.from_degrees(720.0, Gearset::Blue), 2.0);
        assert_eq!(EncoderUnits::Counts.from_degrees(360.0, Gearset::Red), 1800.0);
    }

    #[test]
    fn test_rejects_duplicate_smart_port() {
        let mut ports = PortMap::default();
        ports.imu = ports.tracker_side;
        assert_eq!(
            validate_ports(&ports),
            Err(DeviceError::PortInUse { port: ports.imu })
        );
    }

    #[test]
    fn test_rejects_out_of_range_adi_port() {
        let mut ports = PortMap::default();
        ports.needle = 9;
        assert_eq!(
            validate_ports(&ports),
            Err(DeviceError::InvalidPort { port: 9, kind: "ADI" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_opens_all_devices() {
        let (_world, backend) = sim();
        let registry = DeviceRegistry::open(&backend, &PortMap::default()).unwrap();
        assert_eq!(lock_group(&registry.drivetrain.left).len(), 3);
        assert_eq!(lock_group(&registry.drivetrain.right).len(), 3);
        assert_eq!(registry.arm.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_mirrors_power_and_reports_first_error() {
        let (world, backend) = sim();
        let registry = DeviceRegistry::open(&backend, &PortMap::default()).unwrap();

        registry.drivetrain.apply(DriveCommand::new(0.5, -0.25)).unwrap();
        for port in [1, 2, 3] {
            assert_eq!(world.motor_power(port), Some(0.5));
        }
        for port in [4, 5, 6] {
            assert_eq!(world.motor_power(port), Some(-0.25));
        }

        world.disconnect(PortKind::Smart, 2);
        let err = registry.drivetrain.apply(DriveCommand::new(1.0, 1.0));
        assert_eq!(err, Err(DeviceError::Disconnected { port: 2 }));
        // The other motors on the side still got the command
        assert_eq!(world.motor_power(1), Some(1.0));
        assert_eq!(world.motor_power(3), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_position_skips_failed_motor() {
        let (world, backend) = sim();
        let registry = DeviceRegistry::open(&backend, &PortMap::default()).unwrap();
        world.disconnect(PortKind::Smart, 7);
        assert!(registry.arm.position().is_ok());
        world.disconnect(PortKind::Smart, 8);
        assert!(registry.arm.position().is_err());
    }
}
