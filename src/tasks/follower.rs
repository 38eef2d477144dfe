// Path/turn follower task and the sequencer-side motion client
//
// Protocol:
// - MotionClient is the only writer of the command slot and the settings
// - The follower is the only writer of the completion flag
// - Completion carries the id of the command it refers to, so a new command
//   can never be mistaken for done because of an older flag
// - A wait that times out clears the slot; the follower sees the empty slot
//   and stops driving

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use super::{TaskHandle, spawn_periodic};
use crate::config::FollowerGains;
use crate::devices::Drivetrain;
use crate::error::{Result, RobotError};
use crate::messages::{
    CommandKind, CommandSlot, Completion, DriveCommand, FollowerSettings, MotionCommand, Pose,
    wrap_degrees,
};

const TASK_NAME: &str = "follower";

/// How a wait ended. A timeout is a recovery, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// Result of one control step for the active command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Drive(DriveCommand),
    Done,
}

/// Clamp a proportional output to the speed cap and lift it to the
/// minimum output so small errors still move the base.
fn shape(u: f64, max_speed: f64, min_output: f64) -> f64 {
    let floor = min_output.min(max_speed);
    let magnitude = u.abs().clamp(floor, max_speed);
    magnitude.copysign(u)
}

/// Control law for one cycle. `start` is the pose when the command was picked up.
pub fn control_step(
    command: &MotionCommand,
    start: &Pose,
    pose: &Pose,
    settings: &FollowerSettings,
    gains: &FollowerGains,
) -> Step {
    let max = settings.max_speed.clamp(0.0, 1.0);
    let (mut linear, mut angular) = match *command {
        MotionCommand::Move { distance } => {
            let error = distance - pose.progress_from(start);
            if error.abs() <= gains.move_tolerance {
                return Step::Done;
            }
            let hold = wrap_degrees(start.heading - pose.heading);
            (
                shape(gains.move_kp * error, max, gains.min_output),
                (gains.heading_hold_kp * hold).clamp(-max, max),
            )
        }
        MotionCommand::Turn { heading, tolerance } => {
            let error = wrap_degrees(heading - pose.heading);
            if error.abs() <= tolerance {
                return Step::Done;
            }
            (0.0, shape(gains.turn_kp * error, max, gains.min_output))
        }
    };

    if !settings.forward_enabled {
        linear = 0.0;
    }
    if !settings.rotate_enabled {
        angular = 0.0;
    }

    let (mut left, mut right) = (linear + angular, linear - angular);
    let peak = left.abs().max(right.abs());
    if peak > max && peak > 0.0 {
        left *= max / peak;
        right *= max / peak;
    }
    Step::Drive(DriveCommand::new(left, right))
}

#[derive(Debug, Clone, Copy)]
struct Active {
    id: u64,
    command: MotionCommand,
    start: Pose,
}

/// Follower loop state, moved into the periodic task on start
struct Follower {
    gains: FollowerGains,
    drivetrain: Drivetrain,
    pose_rx: watch::Receiver<Pose>,
    command_rx: watch::Receiver<CommandSlot>,
    settings_rx: watch::Receiver<FollowerSettings>,
    completion_tx: watch::Sender<Completion>,
    active: Option<Active>,
}

impl Follower {
    fn step(&mut self) {
        let slot = *self.command_rx.borrow();
        let settings = *self.settings_rx.borrow();
        let pose = *self.pose_rx.borrow();

        let Some(command) = slot.command else {
            if let Some(active) = self.active.take() {
                info!("Command {} abandoned, stopping base", active.id);
                self.output(DriveCommand::stop());
            }
            return;
        };

        if self.active.is_none_or(|a| a.id != slot.id) {
            let finished = *self.completion_tx.borrow();
            if finished.id == slot.id && finished.done {
                return;
            }
            debug!("Picked up command {}: {:?} from {:?}", slot.id, command, pose);
            self.active = Some(Active {
                id: slot.id,
                command,
                start: pose,
            });
        }

        let Some(active) = self.active else {
            return;
        };
        match control_step(&active.command, &active.start, &pose, &settings, &self.gains) {
            Step::Drive(drive) => self.output(drive),
            Step::Done => {
                info!("Command {} complete at {:?}", active.id, pose);
                self.output(DriveCommand::stop());
                self.active = None;
                self.completion_tx.send_replace(Completion {
                    id: active.id,
                    done: true,
                });
            }
        }
    }

    fn output(&self, drive: DriveCommand) {
        if let Err(e) = self.drivetrain.apply(drive) {
            debug!("Drive output failed: {}", e);
        }
    }
}

/// Lifecycle wrapper around the follower loop
pub struct FollowerTask {
    follower: Option<Follower>,
    handle: Option<TaskHandle>,
}

impl FollowerTask {
    /// Create the follower and the client the sequencer drives it with
    pub fn new(
        gains: FollowerGains,
        drivetrain: Drivetrain,
        pose_rx: watch::Receiver<Pose>,
    ) -> (Self, MotionClient) {
        let (command_tx, command_rx) = watch::channel(CommandSlot::default());
        let (settings_tx, settings_rx) = watch::channel(FollowerSettings::default());
        let (completion_tx, completion_rx) = watch::channel(Completion::default());

        let client = MotionClient {
            command_tx,
            settings_tx,
            completion_rx,
            next_id: 1,
            outstanding: None,
            default_turn_tolerance: gains.turn_tolerance,
        };
        let follower = Follower {
            gains,
            drivetrain,
            pose_rx,
            command_rx,
            settings_rx,
            completion_tx,
            active: None,
        };
        (
            Self {
                follower: Some(follower),
                handle: None,
            },
            client,
        )
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_running())
    }

    /// Start the loop. A follower runs once per autonomous phase.
    pub fn start(&mut self, period: Duration) -> Result<()> {
        let mut follower = self
            .follower
            .take()
            .ok_or(RobotError::AlreadyRunning(TASK_NAME))?;
        self.handle = Some(spawn_periodic(TASK_NAME, period, move || follower.step()));
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
    }
}

/// Sequencer-facing side of the follower
pub struct MotionClient {
    command_tx: watch::Sender<CommandSlot>,
    settings_tx: watch::Sender<FollowerSettings>,
    completion_rx: watch::Receiver<Completion>,
    next_id: u64,
    outstanding: Option<(u64, MotionCommand)>,
    default_turn_tolerance: f64,
}

impl MotionClient {
    fn completed(&self, id: u64) -> bool {
        let c = *self.completion_rx.borrow();
        c.id == id && c.done
    }

    /// True once the most recently issued command has completed. False from the
    /// moment a new command is accepted.
    pub fn command_done(&self) -> bool {
        self.completed(self.next_id - 1)
    }

    /// The command still waiting on completion, if any
    pub fn outstanding(&self) -> Option<MotionCommand> {
        self.outstanding
            .filter(|(id, _)| !self.completed(*id))
            .map(|(_, command)| command)
    }

    /// Queue a command. Rejected while a previous command is unresolved.
    pub fn issue(&mut self, command: MotionCommand) -> Result<u64> {
        if let Some((id, prev)) = self.outstanding {
            if !self.completed(id) {
                return Err(RobotError::CommandOutstanding {
                    id,
                    kind: prev.kind(),
                });
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding = Some((id, command));
        self.command_tx.send_replace(CommandSlot {
            id,
            command: Some(command),
        });
        info!("Issued command {}: {:?}", id, command);
        Ok(id)
    }

    pub fn issue_move(&mut self, distance: f64) -> Result<u64> {
        self.issue(MotionCommand::Move { distance })
    }

    /// Turn to an absolute heading; `tolerance` defaults to the configured one
    pub fn issue_turn(&mut self, heading: f64, tolerance: Option<f64>) -> Result<u64> {
        self.issue(MotionCommand::Turn {
            heading,
            tolerance: tolerance.unwrap_or(self.default_turn_tolerance),
        })
    }

    pub async fn wait_for_move(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        self.wait_for(CommandKind::Move, timeout).await
    }

    pub async fn wait_for_turn(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        self.wait_for(CommandKind::Turn, timeout).await
    }

    /// Block until the outstanding command of `expected` kind completes or
    /// `timeout` elapses. On timeout the command is abandoned.
    pub async fn wait_for(&mut self, expected: CommandKind, timeout: Duration) -> Result<WaitOutcome> {
        let (id, command) = self
            .outstanding
            .filter(|(_, c)| c.kind() == expected)
            .ok_or(RobotError::NoMatchingCommand { expected })?;

        let deadline = Instant::now() + timeout;
        let mut rx = self.completion_rx.clone();
        let signalled = match timeout_at(deadline, rx.wait_for(|c| c.id == id && c.done)).await {
            Ok(Ok(_)) => Some(true),
            Ok(Err(_)) => Some(false),
            Err(_) => None,
        };

        let outcome = match signalled {
            Some(true) => {
                debug!("Command {} resolved by completion", id);
                WaitOutcome::Completed
            }
            Some(false) => {
                // Follower is gone; nothing will signal, so the deadline decides
                warn!("Follower stopped while command {} was pending", id);
                sleep_until(deadline).await;
                self.abandon(id, &command, timeout);
                WaitOutcome::TimedOut
            }
            None => {
                self.abandon(id, &command, timeout);
                WaitOutcome::TimedOut
            }
        };
        self.outstanding = None;
        Ok(outcome)
    }

    fn abandon(&mut self, id: u64, command: &MotionCommand, timeout: Duration) {
        warn!(
            "Command {} ({:?}) timed out after {}ms, abandoning",
            id,
            command,
            timeout.as_millis()
        );
        self.command_tx.send_replace(CommandSlot { id, command: None });
    }

    /// Mask follower output per axis without touching the command
    pub fn set_drive_enabled(&self, forward: bool, rotate: bool) {
        info!("Drive enabled: forward={}, rotate={}", forward, rotate);
        self.settings_tx.send_modify(|s| {
            s.forward_enabled = forward;
            s.rotate_enabled = rotate;
        });
    }

    /// Change the output cap; applies to the command in progress
    pub fn set_max_speed(&self, max_speed: f64) {
        let max_speed = max_speed.clamp(0.0, 1.0);
        info!("Max speed set to {:.2}", max_speed);
        self.settings_tx.send_modify(|s| s.max_speed = max_speed);
    }

    pub fn settings(&self) -> FollowerSettings {
        *self.settings_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::devices::DeviceRegistry;
    use crate::devices::sim::{SimBackend, SimWorld};

    fn enabled() -> FollowerSettings {
        FollowerSettings {
            forward_enabled: true,
            rotate_enabled: true,
            max_speed: 1.0,
        }
    }

    #[test]
    fn test_shape_caps_and_floors() {
        assert_eq!(shape(3.0, 0.5, 0.08), 0.5);
        assert_eq!(shape(-3.0, 0.5, 0.08), -0.5);
        assert_eq!(shape(0.01, 1.0, 0.08), 0.08);
        assert_eq!(shape(-0.01, 1.0, 0.08), -0.08);
        // Floor never exceeds the cap
        assert_eq!(shape(0.01, 0.05, 0.08), 0.05);
    }

    #[test]
    fn test_move_drives_both_sides_forward() {
        let gains = FollowerGains::default();
        let start = Pose::default();
        let cmd = MotionCommand::Move { distance: 20.0 };
        let Step::Drive(drive) = control_step(&cmd, &start, &start, &enabled(), &gains) else {
            panic!("expected drive output");
        };
        assert_eq!(drive.left, 1.0);
        assert_eq!(drive.right, 1.0);
    }

    #[test]
    fn test_move_backwards_and_done_within_tolerance() {
        let gains = FollowerGains::default();
        let start = Pose::default();
        let cmd = MotionCommand::Move { distance: -20.0 };
        let Step::Drive(drive) = control_step(&cmd, &start, &start, &enabled(), &gains) else {
            panic!("expected drive output");
        };
        assert!(drive.left < 0.0 && drive.right < 0.0);

        let near = Pose::new(0.0, -19.7, 0.0);
        assert_eq!(control_step(&cmd, &start, &near, &enabled(), &gains), Step::Done);
    }

    #[test]
    fn test_turn_is_differential_and_takes_short_way() {
        let gains = FollowerGains::default();
        let pose = Pose::new(0.0, 0.0, 170.0);
        // -170 is 20 degrees clockwise from 170
        let cmd = MotionCommand::Turn {
            heading: -170.0,
            tolerance: 1.0,
        };
        let Step::Drive(drive) = control_step(&cmd, &pose, &pose, &enabled(), &gains) else {
            panic!("expected drive output");
        };
        assert!(drive.left > 0.0);
        assert_eq!(drive.left, -drive.right);
    }

    #[test]
    fn test_turn_tolerance_is_respected() {
        let gains = FollowerGains::default();
        let pose = Pose::new(0.0, 0.0, 89.5);
        let loose = MotionCommand::Turn {
            heading: 90.0,
            tolerance: 1.0,
        };
        let tight = MotionCommand::Turn {
            heading: 90.0,
            tolerance: 0.1,
        };
        assert_eq!(control_step(&loose, &pose, &pose, &enabled(), &gains), Step::Done);
        assert!(matches!(
            control_step(&tight, &pose, &pose, &enabled(), &gains),
            Step::Drive(_)
        ));
    }

    #[test]
    fn test_masks_and_speed_cap() {
        let gains = FollowerGains::default();
        let start = Pose::default();
        let cmd = MotionCommand::Move { distance: 20.0 };

        let masked = FollowerSettings {
            forward_enabled: false,
            ..enabled()
        };
        assert_eq!(
            control_step(&cmd, &start, &start, &masked, &gains),
            Step::Drive(DriveCommand::new(0.0, 0.0))
        );

        let capped = FollowerSettings {
            max_speed: 0.4,
            ..enabled()
        };
        let Step::Drive(drive) = control_step(&cmd, &start, &start, &capped, &gains) else {
            panic!("expected drive output");
        };
        assert!((drive.left - 0.4).abs() < 1e-9);
    }

    fn setup() -> (SimWorld, FollowerTask, MotionClient, watch::Sender<Pose>) {
        let config = RobotConfig::default();
        let world = SimWorld::new(&config);
        let backend = SimBackend::new(world.clone(), &config.ports);
        let registry = DeviceRegistry::open(&backend, &config.ports).unwrap();
        let (pose_tx, pose_rx) = watch::channel(Pose::default());
        let (task, client) = FollowerTask::new(config.follower, registry.drivetrain, pose_rx);
        (world, task, client, pose_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_command_rejected_while_outstanding() {
        let (_world, _task, mut client, _pose_tx) = setup();
        client.issue_move(10.0).unwrap();
        let err = client.issue_turn(90.0, None).unwrap_err();
        assert!(matches!(
            err,
            RobotError::CommandOutstanding {
                kind: CommandKind::Move,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_wrong_kind_is_an_error() {
        let (_world, _task, mut client, _pose_tx) = setup();
        assert!(matches!(
            client.wait_for_move(Duration::from_millis(10)).await,
            Err(RobotError::NoMatchingCommand { .. })
        ));
        client.issue_turn(90.0, Some(2.0)).unwrap();
        assert!(matches!(
            client.wait_for_move(Duration::from_millis(10)).await,
            Err(RobotError::NoMatchingCommand {
                expected: CommandKind::Move
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_is_reset_for_new_command() {
        let (_world, mut task, mut client, pose_tx) = setup();
        client.set_drive_enabled(true, true);
        task.start(Duration::from_millis(10)).unwrap();

        // Already at the target heading, so the turn completes on the first cycle
        client.issue_turn(0.0, None).unwrap();
        assert!(!client.command_done());
        let outcome = client.wait_for_turn(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(client.command_done());

        pose_tx.send_replace(Pose::default());
        client.issue_move(12.0).unwrap();
        assert!(!client.command_done());
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_and_stops_base() {
        let (world, mut task, mut client, _pose_tx) = setup();
        client.set_drive_enabled(true, true);
        task.start(Duration::from_millis(10)).unwrap();

        // Pose never changes, so this never settles
        client.issue_move(24.0).unwrap();
        let started = Instant::now();
        let outcome = client.wait_for_move(Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
        assert!(client.outstanding().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(world.motor_power(1), Some(0.0));
        // A new command is accepted after the abandoned one
        client.issue_turn(45.0, None).unwrap();
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_mid_move_keeps_command() {
        let (world, mut task, mut client, pose_tx) = setup();
        let left = RobotConfig::default().ports.drive_left[0].port;
        let power = || world.motor_power(left).unwrap_or_default().abs();
        client.set_drive_enabled(true, true);
        task.start(Duration::from_millis(10)).unwrap();

        let id = client.issue_move(24.0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!((power() - 1.0).abs() < 1e-9);

        client.set_max_speed(0.3);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!((power() - 0.3).abs() < 1e-9);

        client.set_drive_enabled(false, true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(power(), 0.0);
        assert_eq!(client.outstanding(), Some(MotionCommand::Move { distance: 24.0 }));

        client.set_drive_enabled(true, true);
        pose_tx.send_replace(Pose::new(0.0, 24.0, 0.0));
        let outcome = client.wait_for_move(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(client.completion_rx.borrow().id, id);
        task.stop().await;
    }
}
