// Sensor polling task
//
// Reads the tracking wheels, IMU and arm potentiometer each period and
// publishes the latest snapshot. A failed read keeps the previous value and
// marks that sensor stale; the task never gives up on a device.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use super::{TaskHandle, spawn_periodic};
use crate::devices::SensorSet;
use crate::error::DeviceError;
use crate::messages::SensorSnapshot;

pub struct SensorTask {
    sensors: SensorSet,
    snapshot: SensorSnapshot,
    tx: watch::Sender<SensorSnapshot>,
}

impl SensorTask {
    pub fn new(sensors: SensorSet) -> Self {
        let (tx, _rx) = watch::channel(SensorSnapshot::default());
        Self {
            sensors,
            snapshot: SensorSnapshot::default(),
            tx,
        }
    }

    /// Receiver for the published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.tx.subscribe()
    }

    pub fn start(mut self, period: Duration) -> TaskHandle {
        spawn_periodic("sensors", period, move || self.poll())
    }

    /// One polling cycle
    pub fn poll(&mut self) {
        let s = &mut self.snapshot;
        let sensors = &self.sensors;

        refresh(
            "vertical tracker",
            sensors.tracker_vertical.position(),
            &mut s.vertical_deg,
            &mut s.stale.vertical,
        );
        refresh(
            "side tracker",
            sensors.tracker_side.position(),
            &mut s.side_deg,
            &mut s.stale.side,
        );
        refresh(
            "IMU",
            sensors.imu.rotation(),
            &mut s.rotation_deg,
            &mut s.stale.imu,
        );
        refresh(
            "arm potentiometer",
            sensors.arm_pot.value(),
            &mut s.arm_pot,
            &mut s.stale.arm_pot,
        );

        self.tx.send_replace(self.snapshot);
    }
}

/// Store a fresh reading, or keep the last one and flag it stale.
/// Logs only when a sensor changes between healthy and stale.
fn refresh(name: &str, reading: Result<f64, DeviceError>, value: &mut f64, stale: &mut bool) {
    match reading {
        Ok(v) => {
            if *stale {
                info!("{} recovered", name);
            }
            *value = v;
            *stale = false;
        }
        Err(e) => {
            if !*stale {
                warn!("{} read failed, holding last value {:.2}: {}", name, value, e);
            }
            *stale = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::devices::DeviceRegistry;
    use crate::devices::sim::{PortKind, SimBackend, SimWorld};
    use crate::messages::DriveCommand;

    fn setup() -> (SimWorld, DeviceRegistry, RobotConfig) {
        let config = RobotConfig::default();
        let world = SimWorld::new(&config);
        let backend = SimBackend::new(world.clone(), &config.ports);
        let registry = DeviceRegistry::open(&backend, &config.ports).unwrap();
        (world, registry, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_readings() {
        let (_world, registry, config) = setup();
        let mut task = SensorTask::new(registry.sensors);
        let rx = task.subscribe();

        registry.drivetrain.apply(DriveCommand::new(1.0, 1.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.poll();

        let snapshot = *rx.borrow();
        assert!(snapshot.vertical_deg > 0.0);
        assert_eq!(snapshot.side_deg, 0.0);
        assert_eq!(snapshot.arm_pot, config.sim.arm_start);
        assert!(!snapshot.stale.any());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_sensor_holds_last_value() {
        let (world, registry, config) = setup();
        let mut task = SensorTask::new(registry.sensors);
        let rx = task.subscribe();

        registry.drivetrain.apply(DriveCommand::new(0.5, -0.5)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.poll();
        let before = rx.borrow().rotation_deg;
        assert!(before > 0.0);

        world.disconnect(PortKind::Smart, config.ports.imu);
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.poll();
        let snapshot = *rx.borrow();
        assert_eq!(snapshot.rotation_deg, before);
        assert!(snapshot.stale.imu);

        world.reconnect(PortKind::Smart, config.ports.imu);
        task.poll();
        let snapshot = *rx.borrow();
        assert!(snapshot.rotation_deg > before);
        assert!(!snapshot.stale.imu);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_keeps_publishing() {
        let (_world, registry, config) = setup();
        let task = SensorTask::new(registry.sensors);
        let mut rx = task.subscribe();
        let handle = task.start(config.periods.sensor());

        rx.changed().await.unwrap();
        rx.borrow_and_update();
        rx.changed().await.unwrap();
        handle.stop().await;
    }
}
