// Localization (odometry) task
//
// Integrates tracking-wheel deltas and IMU heading into a field pose.
// Arc-based local displacement, rotated into the field frame by the average
// heading over the step (see http://thepilons.ca/wp-content/uploads/2018/10/Tracking.pdf).

use std::f64::consts::PI;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use super::{TaskHandle, spawn_periodic};
use crate::config::Geometry;
use crate::error::{Result, RobotError};
use crate::messages::{Pose, SensorSnapshot};

const TASK_NAME: &str = "localization";

/// Pose integrator. Pure state, no I/O.
#[derive(Debug, Clone)]
pub struct Odometry {
    geometry: Geometry,
    heading_offset: f64,
    prev: Option<(f64, f64, f64)>,
    pose: Pose,
}

impl Odometry {
    pub fn new(geometry: Geometry, heading_offset: f64) -> Self {
        Self {
            geometry,
            heading_offset,
            prev: None,
            pose: Pose::new(0.0, 0.0, heading_offset),
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    fn tracker_inches(&self, degrees: f64) -> f64 {
        degrees / 360.0 * PI * self.geometry.tracking_wheel_diameter
    }

    /// Fold one sensor snapshot into the pose
    pub fn update(&mut self, snapshot: &SensorSnapshot) -> Pose {
        let vertical = self.tracker_inches(snapshot.vertical_deg);
        let side = self.tracker_inches(snapshot.side_deg);
        let heading = (snapshot.rotation_deg + self.heading_offset).to_radians();

        let Some((prev_v, prev_s, prev_h)) = self.prev.replace((vertical, side, heading)) else {
            // First sample only establishes the reference
            self.pose.heading = heading.to_degrees();
            return self.pose;
        };

        let (dv, ds, dh) = (vertical - prev_v, side - prev_s, heading - prev_h);

        let (local_x, local_y) = if dh.abs() < 1e-9 {
            (ds, dv)
        } else {
            let chord = 2.0 * (dh / 2.0).sin();
            (
                chord * (ds / dh + self.geometry.side_offset),
                chord * (dv / dh + self.geometry.vertical_offset),
            )
        };

        let avg = prev_h + dh / 2.0;
        let (sin, cos) = avg.sin_cos();
        self.pose.x += local_y * sin + local_x * cos;
        self.pose.y += local_y * cos - local_x * sin;
        self.pose.heading = heading.to_degrees();
        self.pose
    }
}

/// Owns the pose publisher. Heading offset can only change before start.
pub struct LocalizationTask {
    geometry: Geometry,
    heading_offset: f64,
    snapshot_rx: watch::Receiver<SensorSnapshot>,
    pose_tx: watch::Sender<Pose>,
    handle: Option<TaskHandle>,
}

impl LocalizationTask {
    pub fn new(geometry: Geometry, snapshot_rx: watch::Receiver<SensorSnapshot>) -> Self {
        let (pose_tx, _rx) = watch::channel(Pose::default());
        Self {
            geometry,
            heading_offset: 0.0,
            snapshot_rx,
            pose_tx,
            handle: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Pose> {
        self.pose_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_running())
    }

    /// Redefine the zero-heading reference. Rejected once the task runs.
    pub fn set_heading_offset(&mut self, degrees: f64) -> Result<()> {
        if self.handle.is_some() {
            return Err(RobotError::AlreadyRunning(TASK_NAME));
        }
        info!("Heading offset set to {:.1} deg", degrees);
        self.heading_offset = degrees;
        self.pose_tx.send_replace(Pose::new(0.0, 0.0, degrees));
        Ok(())
    }

    pub fn start(&mut self, period: Duration) -> Result<()> {
        if self.handle.is_some() {
            return Err(RobotError::AlreadyRunning(TASK_NAME));
        }
        let mut odometry = Odometry::new(self.geometry.clone(), self.heading_offset);
        let snapshot_rx = self.snapshot_rx.clone();
        let pose_tx = self.pose_tx.clone();
        self.handle = Some(spawn_periodic(TASK_NAME, period, move || {
            let snapshot = *snapshot_rx.borrow();
            pose_tx.send_replace(odometry.update(&snapshot));
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(vertical_in: f64, rotation_deg: f64) -> SensorSnapshot {
        let geometry = Geometry::default();
        SensorSnapshot {
            vertical_deg: vertical_in / (PI * geometry.tracking_wheel_diameter) * 360.0,
            rotation_deg,
            ..Default::default()
        }
    }

    #[test]
    fn test_straight_line_along_heading() {
        let mut odom = Odometry::new(Geometry::default(), 0.0);
        odom.update(&snapshot(0.0, 0.0));
        let pose = odom.update(&snapshot(10.0, 0.0));
        assert!(pose.x.abs() < 1e-9);
        assert!((pose.y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_heading_offset_rotates_frame() {
        // Offset -90: facing -x, so forward travel decreases x
        let mut odom = Odometry::new(Geometry::default(), -90.0);
        let first = odom.update(&snapshot(0.0, 0.0));
        assert!((first.heading + 90.0).abs() < 1e-9);
        let pose = odom.update(&snapshot(10.0, 0.0));
        assert!((pose.x + 10.0).abs() < 1e-9);
        assert!(pose.y.abs() < 1e-9);
        assert!((pose.heading + 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_turn_in_place_keeps_position() {
        let mut odom = Odometry::new(Geometry::default(), 0.0);
        odom.update(&snapshot(0.0, 0.0));
        let pose = odom.update(&snapshot(0.0, 45.0));
        assert!(pose.x.abs() < 1e-9 && pose.y.abs() < 1e-9);
        assert!((pose.heading - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_quarter_arc_lands_on_chord() {
        // Quarter circle of radius 10 turning clockwise from +y ends at (10, 10)
        let mut odom = Odometry::new(Geometry::default(), 0.0);
        odom.update(&snapshot(0.0, 0.0));
        let arc = 10.0 * PI / 2.0;
        let pose = odom.update(&snapshot(arc, 90.0));
        assert!((pose.x - 10.0).abs() < 1e-6, "x = {}", pose.x);
        assert!((pose.y - 10.0).abs() < 1e-6, "y = {}", pose.y);
    }

    #[test]
    fn test_same_offset_same_interpretation() {
        let readings = [snapshot(0.0, 0.0), snapshot(5.0, 10.0), snapshot(12.0, 30.0)];
        let run = || {
            let mut odom = Odometry::new(Geometry::default(), 25.0);
            readings.iter().map(|s| odom.update(s)).last().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_rejected_after_start() {
        let (_tx, rx) = watch::channel(SensorSnapshot::default());
        let mut task = LocalizationTask::new(Geometry::default(), rx);
        task.set_heading_offset(-90.0).unwrap();
        assert_eq!(task.subscribe().borrow().heading, -90.0);

        task.start(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            task.set_heading_offset(0.0),
            Err(RobotError::AlreadyRunning(_))
        ));
        assert!(matches!(
            task.start(Duration::from_millis(10)),
            Err(RobotError::AlreadyRunning(_))
        ));
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_publishes_integrated_pose() {
        let (tx, rx) = watch::channel(snapshot(0.0, 0.0));
        let mut task = LocalizationTask::new(Geometry::default(), rx);
        let pose_rx = task.subscribe();
        task.start(Duration::from_millis(10)).unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        tx.send_replace(snapshot(6.0, 0.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!((pose_rx.borrow().y - 6.0).abs() < 1e-9);
        task.stop().await;
    }
}
