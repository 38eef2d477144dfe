// Autonomous routines
//
// Each routine is a straight-line script over the Sequencer primitives.
// Timeouts are per step; a step that times out is logged and skipped.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, RobotError};
use crate::sequencer::{Sequencer, compute_turn_heading};
use crate::tasks::arm::ArmLevel;

/// Speed cap for the long ring-intake drive, as a share of the 600 rpm cartridge
const RING_RUSH_MAX_SPEED: f64 = 400.0 / 600.0;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    /// Solo autonomous win point
    WinPoint,
    /// Win point, then the L-shaped ring intake
    RingRush,
}

impl Routine {
    pub const ALL: [Routine; 2] = [Routine::WinPoint, Routine::RingRush];

    pub fn name(&self) -> &'static str {
        match self {
            Routine::WinPoint => "win_point",
            Routine::RingRush => "ring_rush",
        }
    }

    pub async fn run(self, seq: &mut Sequencer<'_>) -> Result<()> {
        info!("Running routine '{}'", self.name());
        match self {
            Routine::WinPoint => win_point(seq).await,
            Routine::RingRush => {
                win_point(seq).await?;
                ring_rush(seq).await
            }
        }
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Routine {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        Routine::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| RobotError::UnknownRoutine(s.to_string()))
    }
}

/// Start facing -90, back onto the goal, then score and clear the line
pub async fn win_point(seq: &mut Sequencer<'_>) -> Result<()> {
    seq.set_heading_offset(-90.0)?;
    seq.issue_turn(-90.0, None)?;
    seq.settle(ms(50)).await;
    seq.start_motion_tasks()?;

    seq.set_drive_enabled(true, true);
    seq.settle(ms(250)).await;
    seq.issue_move(-20.0)?;
    seq.wait_for_move(ms(1000)).await?;
    seq.issue_move(12.0)?;
    seq.wait_for_move(ms(1000)).await?;
    seq.issue_turn(compute_turn_heading(30.5, 26.0, false), None)?;
    seq.wait_for_turn(ms(1200)).await?;

    seq.set_arm_level(ArmLevel::Carry);
    seq.issue_move(10.0)?;
    seq.wait_for_move(ms(1000)).await?;
    seq.settle(ms(150)).await;
    seq.set_batch_actuator(false);
    seq.settle(ms(1000)).await;
    seq.set_needle_actuator(false);
    seq.settle(ms(300)).await;
    seq.issue_move(11.7)?;
    seq.wait_for_move(ms(1000)).await?;
    Ok(())
}

async fn ring_rush(seq: &mut Sequencer<'_>) -> Result<()> {
    seq.set_arm_level(ArmLevel::Stowed);
    seq.issue_move(-12.0)?;
    seq.wait_for_move(ms(1000)).await?;
    seq.issue_turn(180.0, Some(0.1))?;
    seq.wait_for_turn(ms(2000)).await?;
    seq.set_max_speed(RING_RUSH_MAX_SPEED);
    seq.issue_move(-90.0)?;
    seq.wait_for_move(ms(5000)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AUTON_DURATION, RobotConfig};
    use crate::devices::DeviceRegistry;
    use crate::devices::sim::{SimBackend, SimWorld};
    use crate::pneumatics::Pneumatics;
    use crate::sequencer::SequencerState;
    use crate::tasks::arm::ArmTask;
    use crate::tasks::sensors::SensorTask;

    #[test]
    fn test_parse_routine_names() {
        assert_eq!("win_point".parse::<Routine>().unwrap(), Routine::WinPoint);
        assert_eq!("ring_rush".parse::<Routine>().unwrap(), Routine::RingRush);
        assert!(matches!(
            "skills".parse::<Routine>(),
            Err(RobotError::UnknownRoutine(name)) if name == "skills"
        ));
        assert_eq!(Routine::RingRush.to_string(), "ring_rush");
    }

    #[tokio::test(start_paused = true)]
    async fn test_win_point_runs_within_autonomous_period() {
        let config = RobotConfig::default();
        let world = SimWorld::new(&config);
        let backend = SimBackend::new(world.clone(), &config.ports);
        let registry = DeviceRegistry::open(&backend, &config.ports).unwrap();

        let mut sensor_task = SensorTask::new(registry.sensors);
        sensor_task.poll();
        let snapshot_rx = sensor_task.subscribe();
        let sensors = sensor_task.start(config.periods.sensor());
        let (mut arm_task, arm, _feedback) = ArmTask::new(
            config.arm.clone(),
            config.periods.arm(),
            registry.arm,
            registry.clamp,
            snapshot_rx.clone(),
        );
        arm_task.start().unwrap();
        let mut pneumatics = Pneumatics::new(registry.needle, registry.batch);
        pneumatics.set_batch(true);
        pneumatics.set_needle(true);

        let mut seq = Sequencer::new(
            &config,
            snapshot_rx,
            registry.drivetrain,
            arm.clone(),
            &mut pneumatics,
        );
        tokio::time::timeout(AUTON_DURATION, Routine::WinPoint.run(&mut seq))
            .await
            .unwrap()
            .unwrap();
        let elapsed = seq.finish().await;
        assert!(elapsed < AUTON_DURATION);
        assert_eq!(seq.state(), SequencerState::Complete);
        drop(seq);

        assert!(!pneumatics.state().batch_engaged);
        assert!(!pneumatics.state().needle_engaged);
        assert_eq!(arm.state().target_level, ArmLevel::Carry as usize);
        // Ended pointing along the computed heading, in the offset frame
        let heading = compute_turn_heading(30.5, 26.0, false);
        assert!((world.true_heading() - 90.0 - heading).abs() < 3.0);

        arm_task.stop().await;
        sensors.stop().await;
    }
}
