// Competition lifecycle
//
// The host calls these entry points in order:
//   on_init -> on_competition_init -> on_autonomous -> on_disabled -> on_teleop -> on_disabled
// Sensor and arm tasks live from on_init until shutdown. Localization and the
// follower live only inside on_autonomous and are stopped before it returns.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{AUTON_DURATION, RobotConfig, TELEMETRY_HZ};
use crate::devices::{DeviceBackend, DeviceRegistry, Drivetrain};
use crate::error::{Result, RobotError};
use crate::input::ControllerInput;
use crate::messages::{Rumble, SensorSnapshot};
use crate::pneumatics::Pneumatics;
use crate::routines::Routine;
use crate::sequencer::Sequencer;
use crate::tasks::TaskHandle;
use crate::tasks::arm::{ArmClient, ArmTask};
use crate::tasks::sensors::SensorTask;
use crate::telemetry::{Telemetry, TelemetrySources};
use crate::teleop::TeleopLoop;

/// Everything on_init brings up
struct Active {
    drivetrain: Drivetrain,
    pneumatics: Pneumatics,
    arm: ArmClient,
    feedback: mpsc::Receiver<Rumble>,
    snapshot_rx: watch::Receiver<SensorSnapshot>,
    sensors: TaskHandle,
    arm_task: ArmTask,
}

pub struct Robot {
    config: RobotConfig,
    routine: Routine,
    auton_duration: Duration,
    active: Option<Active>,
    telemetry: Option<Telemetry>,
}

impl Robot {
    pub fn new(config: RobotConfig, routine: Routine) -> Self {
        Self {
            config,
            routine,
            auton_duration: AUTON_DURATION,
            active: None,
            telemetry: None,
        }
    }

    /// Override the autonomous period length
    pub fn with_auton_duration(mut self, duration: Duration) -> Self {
        self.auton_duration = duration;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    fn active(&mut self) -> Result<&mut Active> {
        self.active.as_mut().ok_or(RobotError::NotRunning("robot"))
    }

    /// Open every device and start the lifetime tasks
    pub fn on_init(&mut self, backend: &dyn DeviceBackend) -> Result<()> {
        if self.active.is_some() {
            return Err(RobotError::AlreadyRunning("robot"));
        }
        self.config.validate()?;
        let registry = DeviceRegistry::open(backend, &self.config.ports)?;
        let periods = &self.config.periods;

        let mut sensor_task = SensorTask::new(registry.sensors);
        sensor_task.poll();
        let snapshot_rx = sensor_task.subscribe();
        let sensors = sensor_task.start(periods.sensor());

        let (mut arm_task, arm, feedback) = ArmTask::new(
            self.config.arm.clone(),
            periods.arm(),
            registry.arm,
            registry.clamp,
            snapshot_rx.clone(),
        );
        arm_task.start()?;

        self.active = Some(Active {
            drivetrain: registry.drivetrain,
            pneumatics: Pneumatics::new(registry.needle, registry.batch),
            arm,
            feedback,
            snapshot_rx,
            sensors,
            arm_task,
        });
        info!("Robot initialized");
        Ok(())
    }

    /// Start publishing state over zenoh
    pub async fn enable_telemetry(&mut self) -> Result<()> {
        let active = self.active()?;
        let sources = TelemetrySources {
            snapshot: active.snapshot_rx.clone(),
            arm: active.arm.subscribe(),
            actuators: active.pneumatics.subscribe(),
        };
        self.telemetry = Some(Telemetry::start(sources, TELEMETRY_HZ).await?);
        Ok(())
    }

    /// Robot disabled between phases: the base is stopped, lifetime tasks keep running
    pub fn on_disabled(&mut self) -> Result<()> {
        let active = self.active()?;
        if let Err(e) = active.drivetrain.stop() {
            warn!("Failed to stop base: {}", e);
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.clear_pose();
        }
        info!("Robot disabled");
        Ok(())
    }

    pub fn on_competition_init(&mut self) -> Result<()> {
        self.active()?;
        info!("Competition init, routine '{}' selected", self.routine);
        Ok(())
    }

    /// Run the selected routine under the autonomous period. A routine that
    /// overruns is cut off; the motion tasks are stopped either way.
    pub async fn on_autonomous(&mut self) -> Result<Duration> {
        let active = self.active.as_mut().ok_or(RobotError::NotRunning("robot"))?;
        let mut seq = Sequencer::new(
            &self.config,
            active.snapshot_rx.clone(),
            active.drivetrain.clone(),
            active.arm.clone(),
            &mut active.pneumatics,
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.track_pose(seq.subscribe_pose());
        }

        let result = match timeout(self.auton_duration, self.routine.run(&mut seq)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Autonomous period ({:.1}s) ended before routine '{}' finished",
                    self.auton_duration.as_secs_f64(),
                    self.routine
                );
                Ok(())
            }
        };
        let elapsed = seq.finish().await;
        if let Err(e) = &result {
            error!("Routine '{}' failed: {}", self.routine, e);
        }
        result.map(|_| elapsed)
    }

    /// Drive from the controllers until `duration` passes or the primary
    /// controller ends. Returns the number of ticks run.
    pub async fn on_teleop(
        &mut self,
        primary: &mut dyn ControllerInput,
        secondary: &mut dyn ControllerInput,
        duration: Option<Duration>,
    ) -> Result<u64> {
        let period = self.config.periods.teleop();
        let active = self.active()?;
        TeleopLoop {
            drivetrain: &active.drivetrain,
            arm: &active.arm,
            pneumatics: &mut active.pneumatics,
            feedback: &mut active.feedback,
        }
        .run(primary, secondary, period, duration)
        .await
    }

    /// Full match: competition init, autonomous, disabled, teleop, disabled
    pub async fn run_match(
        &mut self,
        primary: &mut dyn ControllerInput,
        secondary: &mut dyn ControllerInput,
        teleop_duration: Duration,
    ) -> Result<()> {
        self.on_competition_init()?;
        if let Err(e) = self.on_autonomous().await {
            // A failed routine costs the autonomous points, not the match
            warn!("Continuing to teleop after autonomous error: {}", e);
        }
        self.on_disabled()?;
        self.on_teleop(primary, secondary, Some(teleop_duration))
            .await?;
        self.on_disabled()
    }

    /// Stop every task and release the devices
    pub async fn shutdown(&mut self) {
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.stop().await;
        }
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.drivetrain.stop() {
                warn!("Failed to stop base: {}", e);
            }
            active.arm_task.stop().await;
            active.sensors.stop().await;
        }
        info!("Robot shut down");
    }
}
