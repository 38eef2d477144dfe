// Autonomous sequencer
//
// A strictly linear script runner. Each motion command is issued, then
// waited on until it completes or its timeout elapses; a timeout abandons
// the command and the script moves on. Arm and pneumatic requests have no
// completion signal and are followed by fixed settle delays instead.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RobotConfig;
use crate::devices::Drivetrain;
use crate::error::Result;
use crate::messages::{CommandKind, MotionCommand, Pose, SensorSnapshot};
use crate::pneumatics::Pneumatics;
use crate::tasks::arm::ArmClient;
use crate::tasks::follower::{FollowerTask, MotionClient, WaitOutcome};
use crate::tasks::odometry::LocalizationTask;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencerState {
    NotStarted,
    Running,
    Waiting(MotionCommand),
    Complete,
}

/// Heading that faces the far corner of a `width` x `length` rectangle,
/// degrees clockwise from straight ahead. Mirrored routines turn the other way.
pub fn compute_turn_heading(width: f64, length: f64, mirrored: bool) -> f64 {
    let heading = width.atan2(length).to_degrees();
    if mirrored { -heading } else { heading }
}

pub struct Sequencer<'a> {
    config: RobotConfig,
    localization: LocalizationTask,
    follower: FollowerTask,
    motion: MotionClient,
    arm: ArmClient,
    pneumatics: &'a mut Pneumatics,
    drivetrain: Drivetrain,
    pose_rx: watch::Receiver<Pose>,
    state: SequencerState,
    started: Option<Instant>,
}

impl<'a> Sequencer<'a> {
    /// Build the phase's localization and follower tasks. Nothing runs until
    /// `start_motion_tasks`.
    pub fn new(
        config: &RobotConfig,
        snapshot_rx: watch::Receiver<SensorSnapshot>,
        drivetrain: Drivetrain,
        arm: ArmClient,
        pneumatics: &'a mut Pneumatics,
    ) -> Self {
        let localization = LocalizationTask::new(config.geometry.clone(), snapshot_rx);
        let pose_rx = localization.subscribe();
        let (follower, motion) =
            FollowerTask::new(config.follower.clone(), drivetrain.clone(), pose_rx.clone());
        Self {
            config: config.clone(),
            localization,
            follower,
            motion,
            arm,
            pneumatics,
            drivetrain,
            pose_rx,
            state: SequencerState::NotStarted,
            started: None,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn pose(&self) -> Pose {
        *self.pose_rx.borrow()
    }

    pub fn subscribe_pose(&self) -> watch::Receiver<Pose> {
        self.pose_rx.clone()
    }

    pub fn motion(&self) -> &MotionClient {
        &self.motion
    }

    fn enter(&mut self) {
        if self.state == SequencerState::NotStarted {
            info!("Autonomous sequence started");
            self.started = Some(Instant::now());
            self.state = SequencerState::Running;
        }
    }

    pub fn set_heading_offset(&mut self, degrees: f64) -> Result<()> {
        self.enter();
        self.localization.set_heading_offset(degrees)
    }

    /// Start odometry and the follower. The heading offset is fixed from here on.
    pub fn start_motion_tasks(&mut self) -> Result<()> {
        self.enter();
        self.localization.start(self.config.periods.odometry())?;
        self.follower.start(self.config.periods.follower())?;
        Ok(())
    }

    pub fn issue_move(&mut self, distance: f64) -> Result<()> {
        self.enter();
        self.motion.issue_move(distance)?;
        Ok(())
    }

    pub fn issue_turn(&mut self, heading: f64, tolerance: Option<f64>) -> Result<()> {
        self.enter();
        self.motion.issue_turn(heading, tolerance)?;
        Ok(())
    }

    pub async fn wait_for_move(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        self.wait(CommandKind::Move, timeout).await
    }

    pub async fn wait_for_turn(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        self.wait(CommandKind::Turn, timeout).await
    }

    async fn wait(&mut self, kind: CommandKind, timeout: Duration) -> Result<WaitOutcome> {
        self.enter();
        if let Some(command) = self.motion.outstanding() {
            self.state = SequencerState::Waiting(command);
        }
        let outcome = self.motion.wait_for(kind, timeout).await;
        self.state = SequencerState::Running;
        outcome
    }

    pub fn set_drive_enabled(&mut self, forward: bool, rotate: bool) {
        self.enter();
        self.motion.set_drive_enabled(forward, rotate);
    }

    pub fn set_max_speed(&mut self, max_speed: f64) {
        self.enter();
        self.motion.set_max_speed(max_speed);
    }

    pub fn set_arm_level(&mut self, level: impl Into<usize>) {
        self.enter();
        self.arm.set_level(level);
    }

    pub fn set_batch_actuator(&mut self, engaged: bool) {
        self.enter();
        self.pneumatics.set_batch(engaged);
    }

    pub fn set_needle_actuator(&mut self, engaged: bool) {
        self.enter();
        self.pneumatics.set_needle(engaged);
    }

    /// Fixed pause standing in for a completion signal
    pub async fn settle(&mut self, delay: Duration) {
        self.enter();
        tokio::time::sleep(delay).await;
    }

    /// Stop the motion tasks and the base. Returns the time since the
    /// sequence started.
    pub async fn finish(&mut self) -> Duration {
        if self.state == SequencerState::Complete {
            return Duration::ZERO;
        }
        self.follower.stop().await;
        self.localization.stop().await;
        if let Err(e) = self.drivetrain.stop() {
            warn!("Failed to stop base: {}", e);
        }
        let elapsed = self.started.map_or(Duration::ZERO, |s| s.elapsed());
        self.state = SequencerState::Complete;
        info!("Autonomous ended in {:.2} seconds", elapsed.as_secs_f64());
        elapsed
    }
}
